#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use wafie_controller_core as core;
pub use wafie_controller_grpc as grpc;
pub use wafie_controller_k8s_api as k8s;
pub use wafie_controller_relay as relay;

mod args;
mod pipeline;

pub use self::args::Args;
