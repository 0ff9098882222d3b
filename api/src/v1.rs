//! `wafie.v1`: the policy store and relay control APIs.

include!(concat!(env!("OUT_DIR"), "/wafie.v1.StateVersionService.rs"));
include!(concat!(env!("OUT_DIR"), "/wafie.v1.ProtectionService.rs"));
include!(concat!(env!("OUT_DIR"), "/wafie.v1.RelayService.rs"));

/// The health-checked name of the relay control service. Reported `SERVING`
/// only while the relay is forwarding.
pub const RELAY_SERVICE: &str = "wafie.v1.RelayService";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtectionMode {
    Unspecified = 0,
    On = 1,
    Off = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ParanoiaLevel {
    Unspecified = 0,
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
    Level4 = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StateTypeId {
    Unspecified = 0,
    Protection = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ModSec {
    #[prost(enumeration = "ProtectionMode", tag = "1")]
    pub protection_mode: i32,
    #[prost(enumeration = "ParanoiaLevel", tag = "2")]
    pub paranoia_level: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtectionDesiredState {
    #[prost(message, optional, tag = "1")]
    pub mod_sec: Option<ModSec>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Port {
    #[prost(uint32, tag = "1")]
    pub number: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint32, tag = "3")]
    pub proxy_listener_port: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Upstream {
    #[prost(string, tag = "1")]
    pub svc_fqdn: String,
    #[prost(string, repeated, tag = "2")]
    pub container_ips: Vec<String>,
    #[prost(message, repeated, tag = "3")]
    pub container_ports: Vec<Port>,
    #[prost(string, tag = "4")]
    pub route_type: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ingress {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(string, tag = "3")]
    pub host: String,
    #[prost(string, tag = "4")]
    pub path: String,
    #[prost(uint32, tag = "5")]
    pub port: u32,
    #[prost(string, tag = "6")]
    pub upstream_host: String,
    #[prost(uint32, tag = "7")]
    pub upstream_port: u32,
    #[prost(uint32, tag = "8")]
    pub proxy_listener_port: u32,
    #[prost(message, optional, tag = "9")]
    pub upstream: Option<Upstream>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Application {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "3")]
    pub ingress: Vec<Ingress>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Protection {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(uint32, tag = "2")]
    pub application_id: u32,
    #[prost(enumeration = "ProtectionMode", tag = "3")]
    pub protection_mode: i32,
    #[prost(message, optional, tag = "4")]
    pub desired_state: Option<ProtectionDesiredState>,
    #[prost(message, optional, tag = "5")]
    pub application: Option<Application>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListProtectionsOptions {
    #[prost(enumeration = "ProtectionMode", optional, tag = "1")]
    pub protection_mode: Option<i32>,
    #[prost(enumeration = "ProtectionMode", optional, tag = "2")]
    pub mod_sec_mode: Option<i32>,
    #[prost(bool, optional, tag = "3")]
    pub include_apps: Option<bool>,
    #[prost(string, optional, tag = "4")]
    pub upstream_host: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListProtectionsRequest {
    #[prost(message, optional, tag = "1")]
    pub options: Option<ListProtectionsOptions>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListProtectionsResponse {
    #[prost(message, repeated, tag = "1")]
    pub protections: Vec<Protection>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetStateVersionRequest {
    #[prost(enumeration = "StateTypeId", tag = "1")]
    pub type_id: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetStateVersionResponse {
    #[prost(string, tag = "1")]
    pub state_version_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RelayOptions {
    /// DNS name of the gateway proxy service.
    #[prost(string, tag = "1")]
    pub proxy_fqdn: String,
    /// Gateway port that accepts the redirected traffic.
    #[prost(uint32, tag = "2")]
    pub proxy_listening_port: u32,
    /// The application's container port that is intercepted.
    #[prost(uint32, tag = "3")]
    pub app_container_port: u32,
    /// Local port the relay listens on inside the pod.
    #[prost(uint32, tag = "4")]
    pub relay_port: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StartRelayRequest {
    #[prost(message, optional, tag = "1")]
    pub options: Option<RelayOptions>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StartRelayResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StopRelayRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StopRelayResponse {}
