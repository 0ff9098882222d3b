//! Maps protections onto gateway resources and relay targets.

use crate::{
    model::Protection,
    xds::{Cluster, Listener, Route, RouteConfiguration, VirtualHost, WafFilter},
};
use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    /// When unset, listeners only carry the router filter.
    pub waf: Option<WafFilter>,
    pub connect_timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    pub listeners: Vec<Listener>,
    pub clusters: Vec<Cluster>,
    pub routes: Vec<RouteConfiguration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            waf: Some(WafFilter::default()),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

impl Default for WafFilter {
    fn default() -> Self {
        Self {
            library_id: "wafie-v1".to_string(),
            library_path: "/usr/local/lib/wafie-modsec.so".to_string(),
            plugin_name: "wafie".to_string(),
        }
    }
}

/// Builds one listener, cluster and route configuration per routable
/// protection.
///
/// Protections whose application has not been discovered, has no ingress or
/// has no proxy port yet are skipped. A protection whose listener port is
/// already taken by an earlier protection is skipped with a warning.
pub fn build(protections: &[Protection], config: &GatewayConfig) -> Resources {
    let mut resources = Resources::default();
    let mut ports = HashMap::<u16, &str>::new();

    for protection in protections {
        let Some((app, ingress)) = protection.ingress() else {
            continue;
        };
        if ingress.proxy_listener_port == 0 {
            debug!(application = %app.name, "Proxy listener port not allocated yet");
            continue;
        }

        if let Some(owner) = ports.get(&ingress.proxy_listener_port) {
            warn!(
                application = %app.name,
                port = ingress.proxy_listener_port,
                %owner,
                "Proxy listener port already in use; skipping"
            );
            continue;
        }
        ports.insert(ingress.proxy_listener_port, &app.name);

        resources.listeners.push(Listener {
            name: app.name.clone(),
            port: ingress.proxy_listener_port,
            route_config: app.name.clone(),
            waf: config.waf.clone(),
        });

        resources.clusters.push(Cluster {
            name: app.name.clone(),
            host: ingress.upstream_host.clone(),
            port: ingress.upstream_port,
            connect_timeout: config.connect_timeout,
        });

        resources.routes.push(RouteConfiguration {
            name: app.name.clone(),
            virtual_hosts: vec![VirtualHost {
                name: app.name.clone(),
                domains: vec![ingress.host.clone()],
                routes: vec![Route {
                    name: app.name.clone(),
                    prefix: "/".to_string(),
                    cluster: app.name.clone(),
                    timeout: Duration::ZERO,
                }],
            }],
        });
    }

    resources
}

/// The upstream hosts fronted by routable protections.
pub fn upstreams(protections: &[Protection]) -> BTreeSet<String> {
    protections
        .iter()
        .filter_map(|p| p.ingress())
        .map(|(_, ingress)| ingress.upstream_host.clone())
        .filter(|host| !host.is_empty())
        .collect()
}
