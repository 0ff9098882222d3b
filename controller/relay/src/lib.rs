#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cri;
pub mod informer;
mod instance;
pub mod lifecycle;
pub mod metrics;
pub mod netns;
mod pods;
pub mod router;
pub mod transport;

pub use self::{
    cri::{CriResolver, ResolveError},
    informer::SliceInformer,
    instance::NamespacedRelays,
    lifecycle::{Lifecycle, NetnsResolver, RelayController, RelayInstances, Workloads},
    metrics::RelayMetrics,
    netns::{NetNs, NetnsError},
    pods::PodWorkloads,
    router::EndpointRouter,
    transport::NamespacedTransport,
};
