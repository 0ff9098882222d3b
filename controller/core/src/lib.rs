#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backoff;
pub mod model;
pub mod poll;
pub mod relay;
pub mod resources;
pub mod store;
pub mod xds;

pub use self::{
    backoff::Backoff,
    model::{
        Application, DesiredState, Ingress, ModSec, Port, Protection, ProtectionFilter,
        ProtectionMode, StateType, Upstream,
    },
    poll::VersionPoller,
    store::PolicyStore,
};
