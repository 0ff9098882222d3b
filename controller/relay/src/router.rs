//! Routes EndpointSlice changes to relay lifecycle operations.

use crate::lifecycle::Lifecycle;
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use wafie_controller_core::{
    relay::RelayOptions, PolicyStore, Protection, ProtectionFilter, ProtectionMode,
};
use wafie_controller_k8s_api::{
    endpoints::{local_pods, service_fqdn, tcp_port},
    EndpointSlice, ResourceExt,
};

/// What the router decided for the endpoints of a slice.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Intent {
    Present(RelayOptions),
    Absent,
}

pub struct EndpointRouter<S, L> {
    store: S,
    lifecycle: L,
    node_name: String,
    gateway_fqdn: String,
    relay_port: u16,
}

// === impl EndpointRouter ===

impl<S, L> EndpointRouter<S, L>
where
    S: PolicyStore,
    L: Lifecycle,
{
    pub fn new(
        store: S,
        lifecycle: L,
        node_name: impl Into<String>,
        gateway_fqdn: impl Into<String>,
        relay_port: u16,
    ) -> Self {
        Self {
            store,
            lifecycle,
            node_name: node_name.into(),
            gateway_fqdn: gateway_fqdn.into(),
            relay_port,
        }
    }

    /// Routes slices until the channel closes or shutdown is signaled. A
    /// slice in hand is always finished first.
    pub async fn run(self, mut slices: mpsc::Receiver<EndpointSlice>, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("Shutdown signaled");
                    return;
                }

                slice = slices.recv() => match slice {
                    Some(slice) => {
                        if let Err(error) = self.route(&slice).await {
                            warn!(%error, slice = %slice.name_any(), "Failed to route endpoints");
                        }
                    }
                    None => return,
                },
            }
        }
    }

    /// Applies the protection state of the slice's service to every local
    /// endpoint. Failures for one endpoint do not stop the others.
    #[instrument(skip_all, fields(slice = %slice.name_any()))]
    pub async fn route(&self, slice: &EndpointSlice) -> Result<()> {
        let Some(fqdn) = service_fqdn(slice) else {
            debug!("Slice is not owned by a Service");
            return Ok(());
        };

        let protections = self
            .store
            .list_protections(ProtectionFilter::upstream(&fqdn))
            .await?;
        let Some(intent) = self.intent(&fqdn, slice, &protections) else {
            return Ok(());
        };

        for pod in local_pods(slice, &self.node_name) {
            let res = match &intent {
                Intent::Present(options) => self.lifecycle.ensure_present(&pod, options).await,
                Intent::Absent => self.lifecycle.ensure_absent(&pod).await,
            };
            if let Err(error) = res {
                warn!(%pod, error = format_args!("{error:#}"), "Failed to reconcile relay");
            }
        }
        Ok(())
    }

    fn intent(
        &self,
        fqdn: &str,
        slice: &EndpointSlice,
        protections: &[Protection],
    ) -> Option<Intent> {
        let Some(protection) = protections.first() else {
            debug!(%fqdn, "Service is not protected");
            return None;
        };
        if protections.len() > 1 {
            warn!(
                %fqdn,
                count = protections.len(),
                "Multiple protections for one upstream; using the first"
            );
        }

        match protection.mode {
            ProtectionMode::On => {}
            ProtectionMode::Off => return Some(Intent::Absent),
            ProtectionMode::Unspecified => {
                debug!(%fqdn, "Protection mode unspecified");
                return None;
            }
        }

        let Some((app, ingress)) = protection.ingress() else {
            info!(%fqdn, "Protection has no ingress yet");
            return None;
        };
        if ingress.proxy_listener_port == 0 {
            info!(%fqdn, application = %app.name, "Proxy listener port not allocated yet");
            return None;
        }
        let Some(app_port) = tcp_port(slice) else {
            warn!(%fqdn, "Slice exposes no TCP port");
            return None;
        };

        Some(Intent::Present(RelayOptions {
            gateway_fqdn: self.gateway_fqdn.clone(),
            gateway_port: ingress.proxy_listener_port,
            app_port,
            relay_port: self.relay_port,
        }))
    }
}
