//! Drives a pod's relay towards present or absent.
//!
//! Relay state is never stored: every pass resolves the pod's network
//! namespace again and probes the relay to learn what is running.

use crate::metrics::{Action, RelayMetrics};
use anyhow::{Context, Result};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};
use wafie_controller_core::{
    relay::{ContainerRef, ProbeState, RelayInstanceSpec, RelayOptions},
    Backoff,
};
use wafie_controller_k8s_api::PodRef;

/// Looks up the container backing a pod.
#[async_trait::async_trait]
pub trait Workloads: Send + Sync + 'static {
    async fn container(&self, pod: &PodRef) -> Result<ContainerRef>;
}

/// Finds the network namespace a container runs in.
#[async_trait::async_trait]
pub trait NetnsResolver: Send + Sync + 'static {
    async fn network_namespace(&self, container: &ContainerRef) -> Result<PathBuf>;
}

/// Relay processes, addressed by the network namespace they run in.
#[async_trait::async_trait]
pub trait RelayInstances: Send + Sync + 'static {
    async fn probe(&self, netns: &Path) -> ProbeState;

    /// Starts a relay process in the instance's namespace. The process comes
    /// up idle.
    async fn spawn(&self, instance: &RelayInstanceSpec) -> Result<()>;

    async fn start(&self, netns: &Path, options: &RelayOptions) -> Result<()>;

    async fn stop(&self, netns: &Path) -> Result<()>;
}

/// The operations the endpoint router dispatches to.
#[async_trait::async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    async fn ensure_present(&self, pod: &PodRef, options: &RelayOptions) -> Result<()>;

    async fn ensure_absent(&self, pod: &PodRef) -> Result<()>;
}

pub struct RelayController<W, N, I> {
    workloads: W,
    resolver: N,
    instances: I,
    node_name: String,
    start_backoff: Backoff,
    start_attempts: u32,
    metrics: RelayMetrics,
}

// A freshly spawned relay needs a moment to bind its API.
const START_BACKOFF: Backoff =
    Backoff::exponential(Duration::from_millis(100), Duration::from_secs(2));
const START_ATTEMPTS: u32 = 8;

// === impl RelayController ===

impl<W, N, I> RelayController<W, N, I>
where
    W: Workloads,
    N: NetnsResolver,
    I: RelayInstances,
{
    pub fn new(
        workloads: W,
        resolver: N,
        instances: I,
        node_name: impl Into<String>,
        metrics: RelayMetrics,
    ) -> Self {
        Self {
            workloads,
            resolver,
            instances,
            node_name: node_name.into(),
            start_backoff: START_BACKOFF,
            start_attempts: START_ATTEMPTS,
            metrics,
        }
    }

    pub fn with_start_backoff(mut self, backoff: Backoff, attempts: u32) -> Self {
        self.start_backoff = backoff;
        self.start_attempts = attempts.max(1);
        self
    }

    async fn instance(&self, pod: &PodRef) -> Result<RelayInstanceSpec> {
        let container = self.workloads.container(pod).await?;
        let netns = self
            .resolver
            .network_namespace(&container)
            .await
            .with_context(|| format!("failed to resolve network namespace of {container}"))?;
        Ok(RelayInstanceSpec {
            namespace: pod.namespace.clone(),
            pod: pod.name.clone(),
            container,
            netns,
            node_name: self.node_name.clone(),
        })
    }

    async fn probe(&self, netns: &Path) -> ProbeState {
        let state = self.instances.probe(netns).await;
        self.metrics.probed(state);
        state
    }

    async fn present(&self, pod: &PodRef, options: &RelayOptions) -> Result<()> {
        let instance = self.instance(pod).await?;
        let netns = instance.netns.as_path();
        match self.probe(netns).await {
            ProbeState::Active => debug!("Relay already forwarding"),
            ProbeState::Unknown => warn!("Relay state unknown; assuming it is running"),
            ProbeState::Idle => {
                self.instances.start(netns, options).await?;
                info!("Started idle relay");
            }
            ProbeState::Absent => {
                self.instances
                    .spawn(&instance)
                    .await
                    .context("failed to spawn relay")?;
                info!(netns = %netns.display(), "Spawned relay");
                self.start_spawned(netns, options).await?;
                info!("Started relay");
            }
        }
        Ok(())
    }

    async fn start_spawned(&self, netns: &Path, options: &RelayOptions) -> Result<()> {
        let mut retry = self.start_backoff.retry();
        loop {
            match self.instances.start(netns, options).await {
                Ok(()) => return Ok(()),
                Err(error) if retry.attempts() + 1 < self.start_attempts => {
                    debug!(%error, attempt = retry.attempts(), "Relay not ready");
                    retry.wait().await;
                }
                Err(error) => return Err(error.context("relay did not accept StartRelay")),
            }
        }
    }

    async fn absent(&self, pod: &PodRef) -> Result<()> {
        let instance = self.instance(pod).await?;
        let netns = instance.netns.as_path();
        match self.probe(netns).await {
            ProbeState::Absent | ProbeState::Idle => debug!("Relay not forwarding"),
            state @ (ProbeState::Active | ProbeState::Unknown) => {
                self.instances.stop(netns).await?;
                info!(?state, "Stopped relay");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<W, N, I> Lifecycle for RelayController<W, N, I>
where
    W: Workloads,
    N: NetnsResolver,
    I: RelayInstances,
{
    #[instrument(skip_all, fields(%pod))]
    async fn ensure_present(&self, pod: &PodRef, options: &RelayOptions) -> Result<()> {
        let res = self.present(pod, options).await;
        self.metrics.reconciled(Action::Present, res.is_ok());
        res
    }

    #[instrument(skip_all, fields(%pod))]
    async fn ensure_absent(&self, pod: &PodRef) -> Result<()> {
        let res = self.absent(pod).await;
        self.metrics.reconciled(Action::Absent, res.is_ok());
        res
    }
}

#[cfg(test)]
mod tests;
