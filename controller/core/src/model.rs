//! Policy records as read from the policy store.
//!
//! These types are owned by the CRUD service; the control plane only reads
//! them.

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtectionMode {
    /// No protection record exists.
    #[default]
    Unspecified,
    On,
    Off,
}

/// Identifies a collection whose version token can be queried.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StateType {
    Protection,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Protection {
    pub id: u32,
    pub application_id: u32,
    pub mode: ProtectionMode,
    pub desired_state: DesiredState,
    pub application: Option<Application>,
}

/// WAF engine settings. Carried through to the gateway untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub mod_sec: Option<ModSec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModSec {
    pub mode: ProtectionMode,
    pub paranoia_level: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Application {
    pub id: u32,
    pub name: String,
    pub ingresses: Vec<Ingress>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ingress {
    pub name: String,
    pub namespace: String,
    pub host: String,
    pub path: String,
    pub port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Allocated once by the policy store and never changed afterwards.
    pub proxy_listener_port: u16,
    pub upstream: Option<Upstream>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Upstream {
    pub svc_fqdn: String,
    pub container_ips: Vec<String>,
    pub container_ports: Vec<Port>,
    pub route_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Port {
    pub number: u16,
    pub name: String,
    pub proxy_listener_port: u16,
}

/// Narrows a `ListProtections` query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProtectionFilter {
    pub mode: Option<ProtectionMode>,
    /// Matches the ModSecurity mode of the protection's desired state.
    pub mod_sec_mode: Option<ProtectionMode>,
    pub include_applications: bool,
    pub upstream_host: Option<String>,
}

// === impl Protection ===

impl Protection {
    /// Returns the application and the ingress that fronts it, if the
    /// application has been fully discovered.
    pub fn ingress(&self) -> Option<(&Application, &Ingress)> {
        let app = self.application.as_ref()?;
        let ingress = app.ingresses.first()?;
        Some((app, ingress))
    }
}

// === impl ProtectionFilter ===

impl ProtectionFilter {
    /// Enabled protections with ModSecurity on, with their applications
    /// expanded.
    pub fn enabled() -> Self {
        Self {
            mode: Some(ProtectionMode::On),
            mod_sec_mode: Some(ProtectionMode::On),
            include_applications: true,
            upstream_host: None,
        }
    }

    /// Every protection, regardless of mode, with applications expanded.
    pub fn all() -> Self {
        Self {
            mode: None,
            mod_sec_mode: None,
            include_applications: true,
            upstream_host: None,
        }
    }

    /// Protections whose ingress points at the given upstream.
    pub fn upstream(host: impl Into<String>) -> Self {
        Self {
            mode: None,
            mod_sec_mode: None,
            include_applications: true,
            upstream_host: Some(host.into()),
        }
    }
}
