//! Tasks that turn policy store changes into gateway and relay work.

use crate::{
    core::{resources, xds::SnapshotApplier, PolicyStore, ProtectionFilter, VersionPoller},
    grpc::XdsMetrics,
};
use std::{collections::BTreeSet, time::Duration};
use tokio::sync::watch;
use tracing::debug;

/// Publishes a gateway snapshot whenever the enabled protections change.
pub(crate) async fn gateway<S: PolicyStore>(
    store: S,
    mut applier: SnapshotApplier,
    metrics: XdsMetrics,
    interval: Duration,
) {
    VersionPoller::new(store, ProtectionFilter::enabled())
        .run(interval, move |protections| {
            match applier.apply(&protections) {
                Ok(_) => metrics.snapshot_published(),
                Err(_) => metrics.snapshot_rejected(),
            }
        })
        .await
}

/// Announces the protected upstreams whenever any protection changes, so
/// that their endpoints are reconciled again.
///
/// Every change is announced, even when the set of hosts is the same, since
/// a protection switched off keeps its upstream.
pub(crate) async fn upstreams<S: PolicyStore>(
    store: S,
    tx: watch::Sender<BTreeSet<String>>,
    interval: Duration,
) {
    VersionPoller::new(store, ProtectionFilter::all())
        .run(interval, move |protections| {
            let hosts = resources::upstreams(&protections);
            debug!(upstreams = hosts.len(), "Protections changed");
            tx.send_replace(hosts);
        })
        .await
}
