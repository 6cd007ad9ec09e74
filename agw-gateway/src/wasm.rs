//! The plugin engine: module compilation, per-request instantiation, and
//! chain execution.
//!
//! The runtime is configured for async execution with epoch interruption:
//! host calls suspend the guest while the host awaits I/O, and a background
//! ticker bounds CPU-only guest execution to ~10 ms between yields so a busy
//! plugin cannot starve the worker it runs on.
//!
//! Guest contract: a single export `on_request() -> i32` (0 allows, anything
//! else denies). Optionally `agw_alloc(len: i32) -> i32` and
//! `agw_on_config(ptr: i32, len: i32)`: when both are present the plugin's
//! config map is serialized as a JSON object into guest memory and delivered
//! at instantiation, and host calls can return data. Host imports live under
//! the `agw` module; result-returning imports yield a packed
//! `ptr << 32 | len` naming a frame written at a guest-allocated region (see
//! `resources::HostResponse` for the frame layout).

mod host;

use crate::resources::Pools;
use crate::snapshot::{ActiveSnapshot, ModuleResult};
use agw_core::{PluginSpec, Route};
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wasmtime::{Config, Engine, Linker, Module, Store};

const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Outcome of running a route's plugin chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    Allow,
    Deny { plugin: String, code: i32 },
    Failed { plugin: String, error: String },
}

pub struct PluginEngine {
    engine: Engine,
    // Successful compiles only, keyed by wasm path; failures are re-tried on
    // the next snapshot that references the path.
    cache: RwLock<HashMap<String, Module>>,
}

// === impl PluginEngine ===

impl PluginEngine {
    pub fn new() -> Result<Arc<Self>> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config)?;

        let ticker = engine.weak();
        std::thread::Builder::new()
            .name("agw-wasm-epoch".to_string())
            .spawn(move || loop {
                std::thread::sleep(EPOCH_TICK);
                match ticker.upgrade() {
                    Some(engine) => engine.increment_epoch(),
                    None => return,
                }
            })?;

        Ok(Arc::new(Self {
            engine,
            cache: RwLock::new(HashMap::new()),
        }))
    }

    /// Compiles every module the snapshot's routes reference, recording
    /// per-path failures for the lifetime of that snapshot.
    pub fn prepare(&self, routes: &[Route]) -> HashMap<String, ModuleResult> {
        let mut table = HashMap::new();
        for route in routes {
            for spec in &route.plugins {
                if table.contains_key(&spec.wasm_path) {
                    continue;
                }
                let result = self.compile(&spec.wasm_path);
                if let Err(error) = &result {
                    warn!(
                        plugin = %spec.name,
                        path = %spec.wasm_path,
                        %error,
                        "plugin compilation failed; requests through it will return 500"
                    );
                }
                table.insert(spec.wasm_path.clone(), result);
            }
        }
        table
    }

    fn compile(&self, path: &str) -> ModuleResult {
        if let Some(module) = self.cache.read().get(path) {
            return Ok(module.clone());
        }
        match Module::from_file(&self.engine, path) {
            Ok(module) => {
                self.cache.write().insert(path.to_string(), module.clone());
                Ok(module)
            }
            Err(error) => Err(error.to_string()),
        }
    }

    /// Runs the route's plugins in declared order. The first non-zero
    /// `on_request` stops the chain.
    pub async fn run_chain(
        &self,
        snapshot: &ActiveSnapshot,
        route: &Route,
        pools: &Arc<Pools>,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for spec in &route.plugins {
            let module = match snapshot.plugin_module(&spec.wasm_path) {
                Some(Ok(module)) => module.clone(),
                Some(Err(error)) => {
                    return ChainOutcome::Failed {
                        plugin: spec.name.clone(),
                        error: error.clone(),
                    }
                }
                None => {
                    return ChainOutcome::Failed {
                        plugin: spec.name.clone(),
                        error: "module was not prepared for this snapshot".to_string(),
                    }
                }
            };

            match self.invoke(&module, spec, pools.clone(), cancel.clone()).await {
                Ok(0) => {}
                Ok(code) => {
                    info!(plugin = %spec.name, code, "plugin denied request");
                    return ChainOutcome::Deny {
                        plugin: spec.name.clone(),
                        code,
                    };
                }
                Err(error) => {
                    warn!(plugin = %spec.name, %error, "plugin execution failed");
                    return ChainOutcome::Failed {
                        plugin: spec.name.clone(),
                        error: error.to_string(),
                    };
                }
            }
        }
        ChainOutcome::Allow
    }

    /// Fresh store and instance per request; the instance dies with the
    /// call.
    async fn invoke(
        &self,
        module: &Module,
        spec: &PluginSpec,
        pools: Arc<Pools>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let ctx = host::HostCtx::new(spec.name.clone(), pools, cancel);
        let mut store = Store::new(&self.engine, ctx);
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);

        let mut linker: Linker<host::HostCtx> = Linker::new(&self.engine);
        host::add_to_linker(&mut linker)?;

        let instance = linker.instantiate_async(&mut store, module).await?;

        // Deliver the config map when the plugin can receive it.
        if let Ok(alloc) = instance.get_typed_func::<i32, i32>(&mut store, "agw_alloc") {
            if let Ok(on_config) =
                instance.get_typed_func::<(i32, i32), ()>(&mut store, "agw_on_config")
            {
                if let Some(memory) = instance.get_memory(&mut store, "memory") {
                    let payload = serde_json::to_vec(&spec.config)?;
                    let ptr = alloc.call_async(&mut store, payload.len() as i32).await?;
                    if ptr > 0 {
                        memory.write(&mut store, ptr as usize, &payload)?;
                        on_config
                            .call_async(&mut store, (ptr, payload.len() as i32))
                            .await?;
                    }
                }
            }
        }

        let on_request = instance.get_typed_func::<(), i32>(&mut store, "on_request")?;
        let code = on_request.call_async(&mut store, ()).await?;
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agw_core::{Cluster, ConfigSnapshot, Endpoint};
    use std::io::Write as _;

    const ALLOW_PLUGIN: &str = r#"
        (module
          (func (export "on_request") (result i32) (i32.const 0)))
    "#;

    const DENY_PLUGIN: &str = r#"
        (module
          (func (export "on_request") (result i32) (i32.const 7)))
    "#;

    // Logs its config payload at info level on instantiation, then allows.
    const CONFIG_LOG_PLUGIN: &str = r#"
        (module
          (import "agw" "agw_log" (func $log (param i32 i32 i32)))
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 1024))
          (func (export "agw_alloc") (param $len i32) (result i32)
            (local $ptr i32)
            global.get $heap
            local.set $ptr
            global.get $heap
            local.get $len
            i32.add
            global.set $heap
            local.get $ptr)
          (func (export "agw_on_config") (param $ptr i32) (param $len i32)
            i32.const 2
            local.get $ptr
            local.get $len
            call $log)
          (func (export "on_request") (result i32) (i32.const 0)))
    "#;

    // Issues `PING` against the redis resource named `rl` and returns the
    // response frame's status byte, or 100 when the host returned nothing.
    const REDIS_STATUS_PLUGIN: &str = r#"
        (module
          (import "agw" "host_redis_command" (func $redis (param i32 i32 i32 i32) (result i64)))
          (memory (export "memory") 1)
          (data (i32.const 0) "rl")
          (data (i32.const 16) "PING")
          (global $heap (mut i32) (i32.const 1024))
          (func (export "agw_alloc") (param $len i32) (result i32)
            (local $ptr i32)
            global.get $heap
            local.set $ptr
            global.get $heap
            local.get $len
            i32.add
            global.set $heap
            local.get $ptr)
          (func (export "on_request") (result i32)
            (local $packed i64)
            i32.const 0
            i32.const 2
            i32.const 16
            i32.const 4
            call $redis
            local.set $packed
            local.get $packed
            i64.eqz
            if (result i32)
              i32.const 100
            else
              local.get $packed
              i64.const 32
              i64.shr_u
              i32.wrap_i64
              i32.load8_u
            end))
    "#;

    fn write_plugin(dir: &tempfile::TempDir, name: &str, wat: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create plugin file");
        file.write_all(wat.as_bytes()).expect("write plugin");
        path.to_string_lossy().into_owned()
    }

    fn snapshot_for(plugins: Vec<PluginSpec>) -> ConfigSnapshot {
        ConfigSnapshot {
            version_id: "test".to_string(),
            routes: vec![Route {
                path_prefix: "/".to_string(),
                cluster_id: "c1".to_string(),
                plugins,
                ..Default::default()
            }],
            clusters: vec![Cluster {
                name: "c1".to_string(),
                endpoints: vec![Endpoint {
                    address: "127.0.0.1".to_string(),
                    port: 8080,
                }],
            }],
            ..Default::default()
        }
    }

    fn plugin(name: &str, path: &str) -> PluginSpec {
        PluginSpec {
            name: name.to_string(),
            wasm_path: path.to_string(),
            config: Default::default(),
        }
    }

    async fn chain_outcome(plugins: Vec<PluginSpec>) -> ChainOutcome {
        let engine = PluginEngine::new().expect("engine");
        let active = ActiveSnapshot::build(snapshot_for(plugins), &engine);
        let route = &active.routes[0];
        engine
            .run_chain(&active, route, &Pools::new(), &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn empty_chain_allows() {
        assert_eq!(chain_outcome(vec![]).await, ChainOutcome::Allow);
    }

    #[tokio::test]
    async fn allowing_plugins_let_the_request_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let allow = write_plugin(&dir, "allow.wat", ALLOW_PLUGIN);
        let outcome = chain_outcome(vec![plugin("a", &allow), plugin("b", &allow)]).await;
        assert_eq!(outcome, ChainOutcome::Allow);
    }

    #[tokio::test]
    async fn first_deny_stops_the_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let allow = write_plugin(&dir, "allow.wat", ALLOW_PLUGIN);
        let deny = write_plugin(&dir, "deny.wat", DENY_PLUGIN);

        let outcome =
            chain_outcome(vec![plugin("a", &allow), plugin("d", &deny), plugin("b", &allow)])
                .await;
        assert_eq!(
            outcome,
            ChainOutcome::Deny {
                plugin: "d".to_string(),
                code: 7,
            }
        );
    }

    #[tokio::test]
    async fn compile_failure_fails_the_chain() {
        let outcome = chain_outcome(vec![plugin("ghost", "/nonexistent/ghost.wasm")]).await;
        assert!(matches!(outcome, ChainOutcome::Failed { plugin, .. } if plugin == "ghost"));
    }

    #[tokio::test]
    async fn config_is_delivered_at_instantiation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_plugin(&dir, "config.wat", CONFIG_LOG_PLUGIN);
        let mut spec = plugin("configured", &path);
        spec.config
            .insert("mode".to_string(), "strict".to_string());

        let outcome = chain_outcome(vec![spec]).await;
        assert_eq!(outcome, ChainOutcome::Allow);
    }

    #[tokio::test]
    async fn host_call_errors_reach_the_guest_as_status_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_plugin(&dir, "redis.wat", REDIS_STATUS_PLUGIN);

        // No redis resource is configured, so the host returns an error
        // frame; the plugin surfaces its status byte as the deny code.
        let outcome = chain_outcome(vec![plugin("redis", &path)]).await;
        assert_eq!(
            outcome,
            ChainOutcome::Deny {
                plugin: "redis".to_string(),
                code: i32::from(crate::resources::STATUS_ERROR),
            }
        );
    }
}
