//! Values describing a relay instance injected into a pod.
//!
//! Nothing here is persisted: a [`RelayInstanceSpec`] is derived again on
//! every reconciliation, and whether a relay runs is only ever learned by
//! probing it.

use std::{fmt, path::PathBuf, str::FromStr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContainerRuntime {
    Containerd,
    CriO,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContainerIdError {
    #[error("container id {0:?} has no runtime prefix")]
    MissingPrefix(String),

    #[error("unsupported container runtime {0:?}")]
    UnsupportedRuntime(String),
}

/// A container id qualified by the runtime that owns it, as reported in a
/// pod's container status (`containerd://<id>`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub runtime: ContainerRuntime,
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayInstanceSpec {
    pub namespace: String,
    pub pod: String,
    pub container: ContainerRef,
    /// Path of the container's network namespace, as seen by this process.
    pub netns: PathBuf,
    pub node_name: String,
}

/// Forwarding parameters handed to a relay when it is started.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RelayOptions {
    pub gateway_fqdn: String,
    pub gateway_port: u16,
    pub app_port: u16,
    pub relay_port: u16,
}

/// What a health probe learned about a relay.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProbeState {
    /// The relay is up and forwarding.
    Active,
    /// The relay process is up but not forwarding.
    Idle,
    /// Nothing listens on the relay API (connection refused).
    Absent,
    /// The probe failed for another reason; the relay may be running.
    Unknown,
}

// === impl ContainerRuntime ===

impl ContainerRuntime {
    /// The CRI endpoint of the runtime.
    pub fn socket(&self) -> &'static str {
        match self {
            Self::Containerd => "unix:///run/containerd/containerd.sock",
            Self::CriO => "unix:///var/run/crio/crio.sock",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Containerd => "containerd",
            Self::CriO => "cri-o",
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

// === impl ContainerRef ===

impl FromStr for ContainerRef {
    type Err = ContainerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once("://")
            .filter(|(_, id)| !id.is_empty())
            .ok_or_else(|| ContainerIdError::MissingPrefix(s.to_string()))?;
        let runtime = match prefix {
            "containerd" => ContainerRuntime::Containerd,
            "cri-o" => ContainerRuntime::CriO,
            other => return Err(ContainerIdError::UnsupportedRuntime(other.to_string())),
        };
        Ok(Self {
            runtime,
            id: id.to_string(),
        })
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.runtime, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_container_ids() {
        assert_eq!(
            "containerd://abc123".parse::<ContainerRef>(),
            Ok(ContainerRef {
                runtime: ContainerRuntime::Containerd,
                id: "abc123".to_string(),
            })
        );
        assert_eq!(
            "cri-o://def456".parse::<ContainerRef>().map(|c| c.runtime.socket()),
            Ok("unix:///var/run/crio/crio.sock")
        );
        assert_eq!(
            "docker://abc".parse::<ContainerRef>(),
            Err(ContainerIdError::UnsupportedRuntime("docker".to_string()))
        );
        assert_eq!(
            "abc".parse::<ContainerRef>(),
            Err(ContainerIdError::MissingPrefix("abc".to_string()))
        );
        assert_eq!(
            "containerd://".parse::<ContainerRef>(),
            Err(ContainerIdError::MissingPrefix("containerd://".to_string()))
        );
    }

    #[test]
    fn displays_qualified_id() {
        let c = ContainerRef {
            runtime: ContainerRuntime::CriO,
            id: "xyz".to_string(),
        };
        assert_eq!(c.to_string(), "cri-o://xyz");
    }
}
