#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod envoy;

pub mod metrics;
pub mod store;
pub mod xds;

pub use self::{metrics::XdsMetrics, store::GrpcPolicyStore, xds::DiscoveryServer};
