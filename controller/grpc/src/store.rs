use anyhow::Result;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use wafie_api::v1::{
    self as api, protection_service_client::ProtectionServiceClient,
    state_version_service_client::StateVersionServiceClient,
};
use wafie_controller_core::{
    Application, DesiredState, Ingress, ModSec, PolicyStore, Port, Protection, ProtectionFilter,
    ProtectionMode, StateType, Upstream,
};

/// A [`PolicyStore`] backed by the policy store's gRPC API.
#[derive(Clone, Debug)]
pub struct GrpcPolicyStore {
    versions: StateVersionServiceClient<Channel>,
    protections: ProtectionServiceClient<Channel>,
}

// === impl GrpcPolicyStore ===

impl GrpcPolicyStore {
    const TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(channel: Channel) -> Self {
        Self {
            versions: StateVersionServiceClient::new(channel.clone()),
            protections: ProtectionServiceClient::new(channel),
        }
    }

    /// Builds a client that connects on first use and reconnects as needed.
    pub fn connect_lazy(addr: impl Into<String>) -> Result<Self> {
        let channel = Endpoint::from_shared(addr.into())?
            .connect_timeout(Self::TIMEOUT)
            .timeout(Self::TIMEOUT)
            .connect_lazy();
        Ok(Self::new(channel))
    }
}

#[async_trait::async_trait]
impl PolicyStore for GrpcPolicyStore {
    async fn state_version(&self, state: StateType) -> Result<String> {
        let type_id = match state {
            StateType::Protection => api::StateTypeId::Protection,
        };
        let rsp = self
            .versions
            .clone()
            .get_state_version(api::GetStateVersionRequest {
                type_id: type_id.into(),
            })
            .await?;
        Ok(rsp.into_inner().state_version_id)
    }

    async fn list_protections(&self, filter: ProtectionFilter) -> Result<Vec<Protection>> {
        let rsp = self
            .protections
            .clone()
            .list_protections(api::ListProtectionsRequest {
                options: Some(to_options(filter)),
            })
            .await?;
        Ok(rsp
            .into_inner()
            .protections
            .into_iter()
            .map(to_protection)
            .collect())
    }
}

fn to_options(filter: ProtectionFilter) -> api::ListProtectionsOptions {
    let ProtectionFilter {
        mode,
        mod_sec_mode,
        include_applications,
        upstream_host,
    } = filter;
    api::ListProtectionsOptions {
        protection_mode: mode.map(|m| to_api_mode(m).into()),
        mod_sec_mode: mod_sec_mode.map(|m| to_api_mode(m).into()),
        include_apps: Some(include_applications),
        upstream_host,
    }
}

fn to_api_mode(mode: ProtectionMode) -> api::ProtectionMode {
    match mode {
        ProtectionMode::Unspecified => api::ProtectionMode::Unspecified,
        ProtectionMode::On => api::ProtectionMode::On,
        ProtectionMode::Off => api::ProtectionMode::Off,
    }
}

fn to_mode(mode: api::ProtectionMode) -> ProtectionMode {
    match mode {
        api::ProtectionMode::Unspecified => ProtectionMode::Unspecified,
        api::ProtectionMode::On => ProtectionMode::On,
        api::ProtectionMode::Off => ProtectionMode::Off,
    }
}

fn to_port(port: u32) -> u16 {
    u16::try_from(port).unwrap_or_default()
}

fn to_protection(p: api::Protection) -> Protection {
    let mode = to_mode(p.protection_mode());
    let desired_state = DesiredState {
        mod_sec: p.desired_state.and_then(|ds| ds.mod_sec).map(|m| ModSec {
            mode: to_mode(m.protection_mode()),
            paranoia_level: u8::try_from(m.paranoia_level).unwrap_or_default(),
        }),
    };
    Protection {
        id: p.id,
        application_id: p.application_id,
        mode,
        desired_state,
        application: p.application.map(to_application),
    }
}

fn to_application(app: api::Application) -> Application {
    Application {
        id: app.id,
        name: app.name,
        ingresses: app.ingress.into_iter().map(to_ingress).collect(),
    }
}

fn to_ingress(ing: api::Ingress) -> Ingress {
    Ingress {
        name: ing.name,
        namespace: ing.namespace,
        host: ing.host,
        path: ing.path,
        port: to_port(ing.port),
        upstream_host: ing.upstream_host,
        upstream_port: to_port(ing.upstream_port),
        proxy_listener_port: to_port(ing.proxy_listener_port),
        upstream: ing.upstream.map(|u| Upstream {
            svc_fqdn: u.svc_fqdn,
            container_ips: u.container_ips,
            container_ports: u
                .container_ports
                .into_iter()
                .map(|p| Port {
                    number: to_port(p.number),
                    name: p.name,
                    proxy_listener_port: to_port(p.proxy_listener_port),
                })
                .collect(),
            route_type: u.route_type,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_protections() {
        let proto = api::Protection {
            id: 7,
            application_id: 3,
            protection_mode: api::ProtectionMode::On.into(),
            desired_state: Some(api::ProtectionDesiredState {
                mod_sec: Some(api::ModSec {
                    protection_mode: api::ProtectionMode::On.into(),
                    paranoia_level: api::ParanoiaLevel::Level2.into(),
                }),
            }),
            application: Some(api::Application {
                id: 3,
                name: "demo".to_string(),
                ingress: vec![api::Ingress {
                    host: "demo.example.com".to_string(),
                    upstream_host: "demo.default.svc".to_string(),
                    upstream_port: 8080,
                    proxy_listener_port: 70000,
                    ..Default::default()
                }],
            }),
        };

        let p = to_protection(proto);
        assert_eq!(p.mode, ProtectionMode::On);
        assert_eq!(
            p.desired_state.mod_sec,
            Some(ModSec {
                mode: ProtectionMode::On,
                paranoia_level: 2,
            })
        );
        let (app, ingress) = p.ingress().expect("ingress must be present");
        assert_eq!(app.name, "demo");
        assert_eq!(ingress.upstream_port, 8080);
        // Out-of-range ports are dropped rather than truncated.
        assert_eq!(ingress.proxy_listener_port, 0);
    }

    #[test]
    fn unknown_modes_are_unspecified() {
        let proto = api::Protection {
            protection_mode: 42,
            ..Default::default()
        };
        assert_eq!(to_protection(proto).mode, ProtectionMode::Unspecified);
    }

    #[test]
    fn encodes_filters() {
        let opts = to_options(ProtectionFilter::upstream("demo.default.svc"));
        assert_eq!(opts.protection_mode, None);
        assert_eq!(opts.mod_sec_mode, None);
        assert_eq!(opts.include_apps, Some(true));
        assert_eq!(opts.upstream_host.as_deref(), Some("demo.default.svc"));

        let opts = to_options(ProtectionFilter::enabled());
        assert_eq!(opts.protection_mode, Some(api::ProtectionMode::On as i32));
        // Protections with ModSecurity off never reach the resource builder.
        assert_eq!(opts.mod_sec_mode, Some(api::ProtectionMode::On as i32));
    }
}
