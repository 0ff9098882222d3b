//! gRPC bindings shared by the WAFie control plane and the relay.
//!
//! Messages are declared with `prost` derives; service stubs are generated at
//! build time.

#![forbid(unsafe_code)]

pub mod cri;
pub mod v1;
