use crate::lifecycle::Workloads;
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::time;
use wafie_controller_core::relay::ContainerRef;
use wafie_controller_k8s_api::{Api, Client, Pod, PodRef};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Looks pods up in the Kubernetes API.
#[derive(Clone)]
pub struct PodWorkloads {
    client: Client,
    timeout: Duration,
}

impl PodWorkloads {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: LOOKUP_TIMEOUT,
        }
    }
}

#[async_trait::async_trait]
impl Workloads for PodWorkloads {
    async fn container(&self, pod: &PodRef) -> Result<ContainerRef> {
        let api = Api::<Pod>::namespaced(self.client.clone(), &pod.namespace);
        let pod = time::timeout(self.timeout, api.get(&pod.name))
            .await
            .map_err(|_| anyhow!("pod lookup timed out"))?
            .context("pod lookup failed")?;
        container_ref(&pod)
    }
}

/// The runtime-qualified id of the pod's first container.
pub fn container_ref(pod: &Pod) -> Result<ContainerRef> {
    let id = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|c| c.container_id.as_deref())
        .ok_or_else(|| anyhow!("pod has no started containers"))?;
    Ok(id.parse()?)
}
