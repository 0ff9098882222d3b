//! The gateway configuration model and the per-node snapshot cache.

use crate::{
    model::Protection,
    resources::{self, GatewayConfig, Resources},
};
use parking_lot::RwLock;
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    /// Name of the route configuration served to this listener over ADS.
    pub route_config: String,
    pub waf: Option<WafFilter>,
}

/// Settings of the WAF HTTP filter loaded by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WafFilter {
    pub library_id: String,
    pub library_path: String,
    pub plugin_name: String,
}

/// A STRICT_DNS, round-robin cluster with a single named endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub prefix: String,
    pub cluster: String,
    /// Zero disables the timeout.
    pub timeout: Duration,
}

/// A versioned bundle of gateway resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub version: String,
    pub listeners: Vec<Listener>,
    pub clusters: Vec<Cluster>,
    pub routes: Vec<RouteConfiguration>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("listener {listener} references unknown route configuration {route_config}")]
    UnknownRouteConfig {
        listener: String,
        route_config: String,
    },

    #[error("route {route} references unknown cluster {cluster}")]
    UnknownCluster { route: String, cluster: String },

    #[error("duplicate {kind} {name}")]
    Duplicate { kind: &'static str, name: String },

    #[error("listeners {first} and {second} both bind port {port}")]
    PortConflict {
        first: String,
        second: String,
        port: u16,
    },
}

/// Latest snapshot per proxy node id.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCache(Arc<RwLock<HashMap<String, watch::Sender<Option<Arc<Snapshot>>>>>>);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApplierState {
    Idle,
    Building,
    Validating,
    Publishing,
}

/// Builds, validates and publishes snapshots for a single proxy node.
#[derive(Debug)]
pub struct SnapshotApplier {
    cache: SnapshotCache,
    node_id: String,
    config: GatewayConfig,
    state: ApplierState,
}

// === impl Snapshot ===

impl Snapshot {
    pub fn new(version: impl Into<String>, resources: Resources) -> Self {
        let Resources {
            listeners,
            clusters,
            routes,
        } = resources;
        Self {
            version: version.into(),
            listeners,
            clusters,
            routes,
        }
    }

    /// Builds a snapshot with a fresh random version.
    pub fn generate(resources: Resources) -> Self {
        Self::new(format!("{:016x}", rand::random::<u64>()), resources)
    }

    /// Checks that every reference in the snapshot resolves within it.
    pub fn consistent(&self) -> Result<(), SnapshotError> {
        let mut clusters = HashSet::new();
        for c in &self.clusters {
            if !clusters.insert(c.name.as_str()) {
                return Err(SnapshotError::Duplicate {
                    kind: "cluster",
                    name: c.name.clone(),
                });
            }
        }

        let mut route_configs = HashSet::new();
        for rc in &self.routes {
            if !route_configs.insert(rc.name.as_str()) {
                return Err(SnapshotError::Duplicate {
                    kind: "route configuration",
                    name: rc.name.clone(),
                });
            }
            for route in rc.virtual_hosts.iter().flat_map(|vh| vh.routes.iter()) {
                if !clusters.contains(route.cluster.as_str()) {
                    return Err(SnapshotError::UnknownCluster {
                        route: route.name.clone(),
                        cluster: route.cluster.clone(),
                    });
                }
            }
        }

        let mut names = HashSet::new();
        let mut ports = HashMap::<u16, &str>::new();
        for l in &self.listeners {
            if !names.insert(l.name.as_str()) {
                return Err(SnapshotError::Duplicate {
                    kind: "listener",
                    name: l.name.clone(),
                });
            }
            if let Some(first) = ports.insert(l.port, &l.name) {
                return Err(SnapshotError::PortConflict {
                    first: first.to_string(),
                    second: l.name.clone(),
                    port: l.port,
                });
            }
            if !route_configs.contains(l.route_config.as_str()) {
                return Err(SnapshotError::UnknownRouteConfig {
                    listener: l.name.clone(),
                    route_config: l.route_config.clone(),
                });
            }
        }

        Ok(())
    }
}

// === impl SnapshotCache ===

impl SnapshotCache {
    /// Replaces the node's snapshot, notifying all watchers.
    pub fn set(&self, node_id: &str, snapshot: Arc<Snapshot>) {
        let mut nodes = self.0.write();
        match nodes.entry(node_id.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().send_replace(Some(snapshot));
            }
            Entry::Vacant(entry) => {
                entry.insert(watch::Sender::new(Some(snapshot)));
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        self.0
            .read()
            .get(node_id)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Watches the node's snapshot. Nodes without a snapshot yet observe
    /// `None` until one is published.
    pub fn watch(&self, node_id: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        if let Some(tx) = self.0.read().get(node_id) {
            return tx.subscribe();
        }
        self.0
            .write()
            .entry(node_id.to_string())
            .or_insert_with(|| watch::Sender::new(None))
            .subscribe()
    }
}

// === impl SnapshotApplier ===

impl SnapshotApplier {
    pub fn new(cache: SnapshotCache, node_id: impl Into<String>, config: GatewayConfig) -> Self {
        Self {
            cache,
            node_id: node_id.into(),
            config,
            state: ApplierState::Idle,
        }
    }

    pub fn state(&self) -> ApplierState {
        self.state
    }

    /// Publishes a snapshot for `protections`. An inconsistent snapshot is
    /// discarded and the previously published one stays in place.
    pub fn apply(&mut self, protections: &[Protection]) -> Result<Arc<Snapshot>, SnapshotError> {
        self.state = ApplierState::Building;
        let resources = resources::build(protections, &self.config);
        self.publish(resources)
    }

    /// Validates and publishes an already-built resource set.
    pub fn publish(&mut self, resources: Resources) -> Result<Arc<Snapshot>, SnapshotError> {
        let snapshot = Snapshot::generate(resources);

        self.state = ApplierState::Validating;
        if let Err(error) = snapshot.consistent() {
            error!(%error, version = %snapshot.version, "Discarding inconsistent snapshot");
            self.state = ApplierState::Idle;
            return Err(error);
        }

        self.state = ApplierState::Publishing;
        let snapshot = Arc::new(snapshot);
        self.cache.set(&self.node_id, snapshot.clone());
        info!(
            node = %self.node_id,
            version = %snapshot.version,
            listeners = snapshot.listeners.len(),
            clusters = snapshot.clusters.len(),
            "Published snapshot"
        );
        debug!(?snapshot);

        self.state = ApplierState::Idle;
        Ok(snapshot)
    }
}
