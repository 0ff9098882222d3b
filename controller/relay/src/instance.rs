use crate::{
    lifecycle::RelayInstances,
    netns::NetNs,
    transport::{is_connection_refused, NamespacedTransport},
};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tonic::transport::Channel;
use tonic_health::pb::{
    health_check_response::ServingStatus, health_client::HealthClient, HealthCheckRequest,
};
use tracing::{debug, warn};
use wafie_api::v1::{
    relay_service_client::RelayServiceClient, StartRelayRequest, StopRelayRequest,
    RELAY_SERVICE,
};
use wafie_controller_core::relay::{ProbeState, RelayInstanceSpec, RelayOptions};

/// Relays reached through their pod's network namespace.
#[derive(Clone, Debug)]
pub struct NamespacedRelays {
    binary: PathBuf,
}

impl NamespacedRelays {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn connect(&self, netns: &Path) -> Result<Channel> {
        NamespacedTransport::new(NetNs::new(netns))
            .connect()
            .await
            .context("failed to connect to relay")
    }
}

#[async_trait::async_trait]
impl RelayInstances for NamespacedRelays {
    async fn probe(&self, netns: &Path) -> ProbeState {
        let channel = match NamespacedTransport::new(NetNs::new(netns)).connect().await {
            Ok(channel) => channel,
            Err(error) if is_connection_refused(&error) => return ProbeState::Absent,
            Err(error) => {
                warn!(%error, "Relay probe failed to connect");
                return ProbeState::Unknown;
            }
        };

        let req = HealthCheckRequest {
            service: RELAY_SERVICE.to_string(),
        };
        match HealthClient::new(channel).check(req).await {
            Ok(rsp) => match rsp.into_inner().status() {
                ServingStatus::Serving => ProbeState::Active,
                ServingStatus::NotServing => ProbeState::Idle,
                status => {
                    warn!(?status, "Unexpected relay health status");
                    ProbeState::Unknown
                }
            },
            Err(status) if is_connection_refused(&status) => ProbeState::Absent,
            Err(status) => {
                warn!(%status, "Relay probe failed");
                ProbeState::Unknown
            }
        }
    }

    async fn spawn(&self, instance: &RelayInstanceSpec) -> Result<()> {
        let args = vec![
            "--netns".to_string(),
            instance.netns.display().to_string(),
        ];
        let pid = NetNs::new(&instance.netns)
            .spawn_detached(&self.binary, args)
            .await?;
        debug!(?pid, pod = %instance.pod, "Relay process started");
        Ok(())
    }

    async fn start(&self, netns: &Path, options: &RelayOptions) -> Result<()> {
        let mut client = RelayServiceClient::new(self.connect(netns).await?);
        let req = StartRelayRequest {
            options: Some(wafie_api::v1::RelayOptions {
                proxy_fqdn: options.gateway_fqdn.clone(),
                proxy_listening_port: options.gateway_port.into(),
                app_container_port: options.app_port.into(),
                relay_port: options.relay_port.into(),
            }),
        };
        client.start_relay(req).await.context("StartRelay failed")?;
        Ok(())
    }

    async fn stop(&self, netns: &Path) -> Result<()> {
        let mut client = RelayServiceClient::new(self.connect(netns).await?);
        client
            .stop_relay(StopRelayRequest {})
            .await
            .context("StopRelay failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{netns::testing::setup_netns_test, transport::RELAY_API_ADDR};
    use tonic_health::ServingStatus as Reporting;

    #[tokio::test]
    async fn absent_in_an_empty_namespace() {
        let scratch = setup_netns_test!();
        let relays = NamespacedRelays::new("/bin/false");
        assert_eq!(
            relays.probe(scratch.netns().path()).await,
            ProbeState::Absent
        );
    }

    #[tokio::test]
    async fn reports_relay_health() {
        let scratch = setup_netns_test!();
        let relays = NamespacedRelays::new("/bin/false");

        let server = scratch
            .serve_health(RELAY_API_ADDR, RELAY_SERVICE, Reporting::NotServing)
            .await;
        assert_eq!(relays.probe(scratch.netns().path()).await, ProbeState::Idle);
        drop(server);

        let scratch = setup_netns_test!();
        let _server = scratch
            .serve_health(RELAY_API_ADDR, RELAY_SERVICE, Reporting::Serving)
            .await;
        assert_eq!(
            relays.probe(scratch.netns().path()).await,
            ProbeState::Active
        );
    }
}
