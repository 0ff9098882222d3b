#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoints;
mod watch;

pub use self::{
    endpoints::PodRef,
    watch::{Event, Watch},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{ContainerStatus, ObjectReference, Pod, PodStatus},
        discovery::v1::{Endpoint, EndpointPort, EndpointSlice},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Resource,
};
