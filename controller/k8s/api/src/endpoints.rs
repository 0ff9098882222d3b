//! Helpers for reading EndpointSlices.

use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use std::fmt;

/// A pod targeted by an endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Returns `<service>.<namespace>.svc` when the slice is owned by a Service.
pub fn service_fqdn(slice: &EndpointSlice) -> Option<String> {
    let owner = slice.owner_references().first()?;
    if owner.kind != "Service" {
        return None;
    }
    let ns = slice.namespace()?;
    Some(format!("{}.{}.svc", owner.name, ns))
}

/// The first TCP port exposed by the slice.
pub fn tcp_port(slice: &EndpointSlice) -> Option<u16> {
    slice
        .ports
        .iter()
        .flatten()
        .filter(|p| p.protocol.as_deref().unwrap_or("TCP") == "TCP")
        .find_map(|p| p.port.and_then(|p| u16::try_from(p).ok()))
}

/// Pods backing the slice that are scheduled on `node`.
pub fn local_pods(slice: &EndpointSlice, node: &str) -> Vec<PodRef> {
    let slice_ns = slice.namespace();
    slice
        .endpoints
        .iter()
        .filter(|ep| ep.node_name.as_deref() == Some(node))
        .filter_map(|ep| {
            let target = ep.target_ref.as_ref()?;
            if target.kind.as_deref() != Some("Pod") {
                return None;
            }
            Some(PodRef {
                namespace: target.namespace.clone().or_else(|| slice_ns.clone())?,
                name: target.name.clone()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::{
            core::v1::ObjectReference,
            discovery::v1::{Endpoint, EndpointPort},
        },
        apimachinery::pkg::apis::meta::v1::OwnerReference,
    };
    use kube::api::ObjectMeta;

    fn mk_slice(owner_kind: &str) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some("demo-abcde".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: owner_kind.to_string(),
                    name: "demo".to_string(),
                    api_version: "v1".to_string(),
                    uid: "uid".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![
                mk_endpoint("demo-1", "node-a"),
                mk_endpoint("demo-2", "node-b"),
            ],
            ports: Some(vec![
                EndpointPort {
                    name: Some("dns".to_string()),
                    port: Some(53),
                    protocol: Some("UDP".to_string()),
                    ..Default::default()
                },
                EndpointPort {
                    name: Some("http".to_string()),
                    port: Some(8080),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
        }
    }

    fn mk_endpoint(pod: &str, node: &str) -> Endpoint {
        Endpoint {
            addresses: vec!["10.0.0.1".to_string()],
            node_name: Some(node.to_string()),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_owned_slice() {
        let slice = mk_slice("Service");
        assert_eq!(service_fqdn(&slice).as_deref(), Some("demo.default.svc"));
        assert_eq!(tcp_port(&slice), Some(8080));
        assert_eq!(
            local_pods(&slice, "node-a"),
            vec![PodRef {
                namespace: "default".to_string(),
                name: "demo-1".to_string(),
            }]
        );
        assert!(local_pods(&slice, "node-c").is_empty());
    }

    #[test]
    fn ignores_other_owners() {
        assert_eq!(service_fqdn(&mk_slice("Deployment")), None);

        let mut slice = mk_slice("Service");
        slice.metadata.owner_references = None;
        assert_eq!(service_fqdn(&slice), None);
    }
}
