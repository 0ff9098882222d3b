//! Resolves a container's network namespace through the CRI.

use crate::lifecycle::NetnsResolver;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{net::UnixStream, time};
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;
use wafie_api::cri::{runtime_service_client::RuntimeServiceClient, ContainerStatusRequest};
use wafie_controller_core::relay::{ContainerRef, ContainerRuntime};

const CRI_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to connect to {runtime} at {socket}: {source}")]
    Connect {
        runtime: ContainerRuntime,
        socket: &'static str,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("container status request failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("container status request timed out")]
    Timeout,

    #[error("container status has no verbose info")]
    MissingInfo,

    #[error("invalid runtime spec: {0}")]
    InvalidSpec(#[from] serde_json::Error),

    #[error("runtime spec has no network namespace path")]
    MissingNetns,
}

/// Queries the node's container runtime for `ContainerStatus(verbose)`.
#[derive(Clone, Debug)]
pub struct CriResolver {
    /// Where the host filesystem is mounted, when this process runs in a
    /// container.
    host_root: Option<PathBuf>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct VerboseInfo {
    #[serde(rename = "runtimeSpec")]
    runtime_spec: RuntimeSpec,
}

#[derive(Debug, Deserialize)]
struct RuntimeSpec {
    #[serde(default)]
    linux: Option<LinuxSpec>,
}

#[derive(Debug, Deserialize)]
struct LinuxSpec {
    #[serde(default)]
    namespaces: Vec<Namespace>,
}

#[derive(Debug, Deserialize)]
struct Namespace {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: Option<String>,
}

// === impl CriResolver ===

impl CriResolver {
    pub fn new(host_root: Option<PathBuf>) -> Self {
        Self {
            host_root,
            timeout: CRI_TIMEOUT,
        }
    }

    async fn connect(&self, runtime: ContainerRuntime) -> Result<Channel, ResolveError> {
        let socket = runtime.socket();
        let path = self.rooted(Path::new(socket.trim_start_matches("unix://")));
        // The authority is unused over a unix socket.
        Endpoint::from_static("http://cri.local")
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move { UnixStream::connect(path).await.map(TokioIo::new) }
            }))
            .await
            .map_err(|source| ResolveError::Connect {
                runtime,
                socket,
                source,
            })
    }

    async fn resolve(&self, container: &ContainerRef) -> Result<PathBuf, ResolveError> {
        let channel = self.connect(container.runtime).await?;
        let mut client = RuntimeServiceClient::new(channel);
        let req = ContainerStatusRequest {
            container_id: container.id.clone(),
            verbose: true,
        };
        let rsp = time::timeout(self.timeout, client.container_status(req))
            .await
            .map_err(|_| ResolveError::Timeout)??
            .into_inner();

        let info = rsp.info.get("info").ok_or(ResolveError::MissingInfo)?;
        let path = network_namespace(info)?;
        debug!(container = %container, netns = %path.display(), "Resolved network namespace");
        Ok(self.rooted(&path))
    }

    fn rooted(&self, path: &Path) -> PathBuf {
        match &self.host_root {
            Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
            None => path.to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl NetnsResolver for CriResolver {
    async fn network_namespace(&self, container: &ContainerRef) -> anyhow::Result<PathBuf> {
        Ok(self.resolve(container).await?)
    }
}

/// Extracts the network namespace path from the runtime's verbose info.
fn network_namespace(info: &str) -> Result<PathBuf, ResolveError> {
    let info = serde_json::from_str::<VerboseInfo>(info)?;
    info.runtime_spec
        .linux
        .into_iter()
        .flat_map(|linux| linux.namespaces)
        .find(|ns| ns.kind == "network")
        .and_then(|ns| ns.path)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or(ResolveError::MissingNetns)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINERD_INFO: &str = r#"{
        "sandboxID": "4c3b",
        "pid": 2871780,
        "runtimeSpec": {
            "ociVersion": "1.1.0",
            "linux": {
                "namespaces": [
                    {"type": "pid"},
                    {"type": "ipc", "path": "/proc/2871700/ns/ipc"},
                    {"type": "network", "path": "/var/run/netns/cni-0b6c1a2e"}
                ]
            }
        }
    }"#;

    #[test]
    fn parses_network_namespace() {
        assert_eq!(
            network_namespace(CONTAINERD_INFO).expect("netns"),
            PathBuf::from("/var/run/netns/cni-0b6c1a2e")
        );
    }

    #[test]
    fn rejects_missing_namespace() {
        let info = r#"{"runtimeSpec": {"linux": {"namespaces": [{"type": "network"}]}}}"#;
        assert!(matches!(
            network_namespace(info),
            Err(ResolveError::MissingNetns)
        ));

        let info = r#"{"runtimeSpec": {}}"#;
        assert!(matches!(
            network_namespace(info),
            Err(ResolveError::MissingNetns)
        ));

        assert!(matches!(
            network_namespace("not json"),
            Err(ResolveError::InvalidSpec(_))
        ));
    }

    #[test]
    fn reroots_under_host_mount() {
        let resolver = CriResolver::new(Some(PathBuf::from("/host")));
        assert_eq!(
            resolver.rooted(Path::new("/var/run/netns/cni-0b6c1a2e")),
            PathBuf::from("/host/var/run/netns/cni-0b6c1a2e")
        );
        assert_eq!(
            CriResolver::new(None).rooted(Path::new("/proc/1/ns/net")),
            PathBuf::from("/proc/1/ns/net")
        );
    }
}
