//! Wire schema for the control-plane/data-plane snapshot stream.
//!
//! The prost/tonic output for `proto/agw.proto` is vendored under `src/gen/`
//! so the workspace builds without protoc. Conversions to and from the
//! `agw-core` model live in [`convert`]; both processes speak the core model
//! and only touch these types at the transport boundary.

pub mod v1 {
    include!("gen/agw.v1.rs");
}

mod convert;
