//! Conversion of snapshot resources into Envoy v3 messages.

use crate::xds::ResourceType;
use envoy_types::pb::{
    envoy::{
        config::{
            accesslog::v3::{access_log, AccessLog},
            cluster::v3::{cluster, Cluster},
            core::v3::{
                address, config_source, socket_address, Address, AggregatedConfigSource,
                ApiVersion, ConfigSource, SocketAddress,
            },
            endpoint::v3::{
                lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
            },
            listener::v3::{filter, Filter, FilterChain, Listener},
            route::v3::{
                route, route_action, route_match, Route, RouteAction, RouteConfiguration,
                RouteMatch, VirtualHost,
            },
        },
        extensions::{
            access_loggers::stream::v3::StdoutAccessLog,
            filters::{
                http::router::v3::Router,
                network::http_connection_manager::v3::{
                    http_connection_manager, http_filter, HttpConnectionManager, HttpFilter, Rds,
                },
            },
        },
    },
    google::protobuf::{Any, BoolValue, Duration},
};
use prost::Message;
use wafie_controller_core::xds::{self as model, Snapshot, WafFilter};

pub(crate) const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
pub(crate) const GOLANG_FILTER: &str = "envoy.filters.http.golang";
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const STDOUT_ACCESS_LOG: &str = "envoy.access_loggers.stdout";

const HTTP_CONNECTION_MANAGER_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const STDOUT_ACCESS_LOG_TYPE: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.stream.v3.StdoutAccessLog";
const GOLANG_FILTER_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.http.golang.v3alpha.Config";

/// Configuration of Envoy's contrib Go filter, which loads the WAF plugin.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct GolangFilterConfig {
    #[prost(string, tag = "1")]
    pub library_id: String,
    #[prost(string, tag = "2")]
    pub library_path: String,
    #[prost(string, tag = "3")]
    pub plugin_name: String,
}

/// Encodes the snapshot's resources of the given type, restricted to `names`
/// unless `names` is empty.
pub(crate) fn resources(snapshot: &Snapshot, ty: ResourceType, names: &[String]) -> Vec<Any> {
    let wanted = |name: &str| names.is_empty() || names.iter().any(|n| n == name);
    match ty {
        ResourceType::Listener => snapshot
            .listeners
            .iter()
            .filter(|l| wanted(&l.name))
            .map(|l| any(ty.type_url(), &listener(l)))
            .collect(),
        ResourceType::Cluster => snapshot
            .clusters
            .iter()
            .filter(|c| wanted(&c.name))
            .map(|c| any(ty.type_url(), &cluster(c)))
            .collect(),
        ResourceType::Route => snapshot
            .routes
            .iter()
            .filter(|rc| wanted(&rc.name))
            .map(|rc| any(ty.type_url(), &route_configuration(rc)))
            .collect(),
        // Clusters carry their endpoints inline and no secrets or runtime
        // layers are served.
        ResourceType::Endpoint | ResourceType::Secret | ResourceType::Runtime => Vec::new(),
    }
}

fn any<M: Message>(type_url: &str, msg: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

fn duration(d: std::time::Duration) -> Duration {
    Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

fn tcp_address(host: &str, port: u16) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            protocol: socket_address::Protocol::Tcp as i32,
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port.into())),
            ..Default::default()
        })),
    }
}

pub(crate) fn listener(l: &model::Listener) -> Listener {
    let hcm = HttpConnectionManager {
        codec_type: http_connection_manager::CodecType::Auto as i32,
        stat_prefix: "http".to_string(),
        generate_request_id: Some(BoolValue { value: true }),
        access_log: vec![AccessLog {
            name: STDOUT_ACCESS_LOG.to_string(),
            config_type: Some(access_log::ConfigType::TypedConfig(any(
                STDOUT_ACCESS_LOG_TYPE,
                &StdoutAccessLog::default(),
            ))),
            ..Default::default()
        }],
        http_filters: http_filters(l.waf.as_ref()),
        upgrade_configs: vec![http_connection_manager::UpgradeConfig {
            upgrade_type: "websocket".to_string(),
            ..Default::default()
        }],
        route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(ConfigSource {
                resource_api_version: ApiVersion::V3 as i32,
                config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource {},
                )),
                ..Default::default()
            }),
            route_config_name: l.route_config.clone(),
        })),
        ..Default::default()
    };

    Listener {
        name: l.name.clone(),
        address: Some(tcp_address("0.0.0.0", l.port)),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: HTTP_CONNECTION_MANAGER.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(any(
                    HTTP_CONNECTION_MANAGER_TYPE,
                    &hcm,
                ))),
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// The WAF filter, when configured, always runs before the router.
fn http_filters(waf: Option<&WafFilter>) -> Vec<HttpFilter> {
    let waf = waf.map(|waf| HttpFilter {
        name: GOLANG_FILTER.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(any(
            GOLANG_FILTER_TYPE,
            &GolangFilterConfig {
                library_id: waf.library_id.clone(),
                library_path: waf.library_path.clone(),
                plugin_name: waf.plugin_name.clone(),
            },
        ))),
        ..Default::default()
    });
    let router = HttpFilter {
        name: ROUTER_FILTER.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(any(
            ROUTER_TYPE,
            &Router::default(),
        ))),
        ..Default::default()
    };
    waf.into_iter().chain(Some(router)).collect()
}

pub(crate) fn cluster(c: &model::Cluster) -> Cluster {
    Cluster {
        name: c.name.clone(),
        connect_timeout: Some(duration(c.connect_timeout)),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::StrictDns as i32,
        )),
        lb_policy: cluster::LbPolicy::RoundRobin as i32,
        dns_lookup_family: cluster::DnsLookupFamily::V4Only as i32,
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: c.name.clone(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                        address: Some(tcp_address(&c.host, c.port)),
                        ..Default::default()
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn route_configuration(rc: &model::RouteConfiguration) -> RouteConfiguration {
    RouteConfiguration {
        name: rc.name.clone(),
        virtual_hosts: rc
            .virtual_hosts
            .iter()
            .map(|vh| VirtualHost {
                name: vh.name.clone(),
                domains: vh.domains.clone(),
                routes: vh.routes.iter().map(route).collect(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn route(r: &model::Route) -> Route {
    Route {
        name: r.name.clone(),
        r#match: Some(RouteMatch {
            path_specifier: Some(route_match::PathSpecifier::Prefix(r.prefix.clone())),
            ..Default::default()
        }),
        action: Some(route::Action::Route(RouteAction {
            cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(r.cluster.clone())),
            timeout: Some(duration(r.timeout)),
            ..Default::default()
        })),
        ..Default::default()
    }
}
