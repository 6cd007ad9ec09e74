//! Host imports exposed to plugin instances under the `agw` module.
//!
//! All pointer/length arguments reference the instance's linear memory and
//! are validated before use. Result-returning imports suspend the guest
//! while the host awaits Redis or SQL, write a response frame into a
//! guest-allocated region, and return `ptr << 32 | len` (0 when the guest
//! offers no `agw_alloc` or allocation fails).

use crate::resources::{HostResponse, Pools};
use anyhow::{Context as _, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Extern, Linker};

pub(crate) struct HostCtx {
    plugin: String,
    pools: Arc<Pools>,
    cancel: CancellationToken,
}

// === impl HostCtx ===

impl HostCtx {
    pub(crate) fn new(plugin: String, pools: Arc<Pools>, cancel: CancellationToken) -> Self {
        Self {
            plugin,
            pools,
            cancel,
        }
    }
}

pub(crate) fn add_to_linker(linker: &mut Linker<HostCtx>) -> Result<()> {
    linker.func_wrap("agw", "agw_log", agw_log)?;

    linker.func_wrap_async(
        "agw",
        "host_redis_command",
        |mut caller: Caller<'_, HostCtx>,
         (name_ptr, name_len, cmd_ptr, cmd_len): (i32, i32, i32, i32)| {
            Box::new(async move {
                let name = match read_guest_string(&mut caller, name_ptr, name_len) {
                    Ok(name) => name,
                    Err(error) => {
                        warn!(%error, "bad host_redis_command name argument");
                        return 0i64;
                    }
                };
                let command = match read_guest_string(&mut caller, cmd_ptr, cmd_len) {
                    Ok(command) => command,
                    Err(error) => {
                        warn!(%error, "bad host_redis_command command argument");
                        return 0i64;
                    }
                };

                let pools = caller.data().pools.clone();
                let cancel = caller.data().cancel.clone();
                let response = tokio::select! {
                    _ = cancel.cancelled() => HostResponse::cancelled(),
                    response = pools.redis_command(&name, &command) => response,
                };

                write_guest_response(&mut caller, &response.encode()).await
            })
        },
    )?;

    linker.func_wrap_async(
        "agw",
        "host_db_query",
        |mut caller: Caller<'_, HostCtx>,
         (name_ptr, name_len, sql_ptr, sql_len): (i32, i32, i32, i32)| {
            Box::new(async move {
                let name = match read_guest_string(&mut caller, name_ptr, name_len) {
                    Ok(name) => name,
                    Err(error) => {
                        warn!(%error, "bad host_db_query name argument");
                        return 0i64;
                    }
                };
                let sql = match read_guest_string(&mut caller, sql_ptr, sql_len) {
                    Ok(sql) => sql,
                    Err(error) => {
                        warn!(%error, "bad host_db_query sql argument");
                        return 0i64;
                    }
                };

                let pools = caller.data().pools.clone();
                let cancel = caller.data().cancel.clone();
                let response = tokio::select! {
                    _ = cancel.cancelled() => HostResponse::cancelled(),
                    response = pools.db_query(&name, &sql) => response,
                };

                write_guest_response(&mut caller, &response.encode()).await
            })
        },
    )?;

    Ok(())
}

fn agw_log(mut caller: Caller<'_, HostCtx>, level: i32, ptr: i32, len: i32) {
    let message = match read_guest_string(&mut caller, ptr, len) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "bad agw_log arguments");
            return;
        }
    };
    let plugin = caller.data().plugin.clone();
    match level {
        0 => trace!(plugin = %plugin, "{message}"),
        1 => debug!(plugin = %plugin, "{message}"),
        2 => info!(plugin = %plugin, "{message}"),
        3 => warn!(plugin = %plugin, "{message}"),
        _ => error!(plugin = %plugin, "{message}"),
    }
}

fn read_guest_string(caller: &mut Caller<'_, HostCtx>, ptr: i32, len: i32) -> Result<String> {
    anyhow::ensure!(ptr >= 0 && len >= 0, "negative guest pointer or length");
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .context("plugin has no linear memory export")?;
    let mut buffer = vec![0u8; len as usize];
    memory
        .read(&mut *caller, ptr as usize, &mut buffer)
        .context("guest pointer out of bounds")?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Allocates a guest region via `agw_alloc`, writes the frame, and packs the
/// location into an i64. Returns 0 when the guest cannot receive data.
async fn write_guest_response(caller: &mut Caller<'_, HostCtx>, frame: &[u8]) -> i64 {
    let plugin = caller.data().plugin.clone();

    let Some(alloc) = caller.get_export("agw_alloc").and_then(Extern::into_func) else {
        warn!(plugin = %plugin, "plugin lacks agw_alloc; host result dropped");
        return 0;
    };
    let alloc = match alloc.typed::<i32, i32>(&mut *caller) {
        Ok(alloc) => alloc,
        Err(error) => {
            warn!(plugin = %plugin, %error, "agw_alloc has the wrong signature");
            return 0;
        }
    };
    let ptr = match alloc.call_async(&mut *caller, frame.len() as i32).await {
        Ok(ptr) => ptr,
        Err(error) => {
            warn!(plugin = %plugin, %error, "agw_alloc trapped");
            return 0;
        }
    };
    if ptr <= 0 {
        return 0;
    }

    let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
        return 0;
    };
    if let Err(error) = memory.write(&mut *caller, ptr as usize, frame) {
        warn!(plugin = %plugin, %error, "guest allocation out of bounds");
        return 0;
    }

    ((ptr as i64) << 32) | (frame.len() as i64)
}
