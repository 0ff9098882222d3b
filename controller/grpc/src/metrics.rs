use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct XdsMetrics {
    streams: Gauge,
    stream_duration: Histogram,
    responses: Family<TypeLabels, Counter>,
    nacks: Family<TypeLabels, Counter>,
    snapshots: Family<SnapshotLabels, Counter>,
}

/// Tracks a single discovery stream until dropped.
pub(crate) struct StreamGuard {
    start: time::Instant,
    streams: Gauge,
    duration: Histogram,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    resource_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct SnapshotLabels {
    result: &'static str,
}

// === impl XdsMetrics ===

impl XdsMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let streams = Gauge::default();
        reg.register(
            "streams",
            "Number of open discovery streams",
            streams.clone(),
        );

        // Proxies keep streams open until the connection's max age.
        let stream_duration = Histogram::new([1.0, 60.0, 300.0, 1800.0]);
        reg.register_with_unit(
            "stream_duration",
            "Histogram of discovery stream lifetimes",
            Unit::Seconds,
            stream_duration.clone(),
        );

        let responses = Family::<TypeLabels, Counter>::default();
        reg.register(
            "responses",
            "Total number of discovery responses sent to proxies",
            responses.clone(),
        );

        let nacks = Family::<TypeLabels, Counter>::default();
        reg.register(
            "nacks",
            "Total number of discovery responses rejected by proxies",
            nacks.clone(),
        );

        let snapshots = Family::<SnapshotLabels, Counter>::default();
        reg.register(
            "snapshots",
            "Total number of snapshots built, by result",
            snapshots.clone(),
        );

        Self {
            streams,
            stream_duration,
            responses,
            nacks,
            snapshots,
        }
    }

    pub fn snapshot_published(&self) {
        self.snapshots
            .get_or_create(&SnapshotLabels { result: "published" })
            .inc();
    }

    pub fn snapshot_rejected(&self) {
        self.snapshots
            .get_or_create(&SnapshotLabels { result: "rejected" })
            .inc();
    }

    pub(crate) fn response(&self, resource_type: &'static str) {
        self.responses
            .get_or_create(&TypeLabels { resource_type })
            .inc();
    }

    pub(crate) fn nack(&self, resource_type: &'static str) {
        self.nacks.get_or_create(&TypeLabels { resource_type }).inc();
    }

    pub(crate) fn stream(&self) -> StreamGuard {
        self.streams.inc();
        StreamGuard {
            start: time::Instant::now(),
            streams: self.streams.clone(),
            duration: self.stream_duration.clone(),
        }
    }
}

impl Default for XdsMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl StreamGuard ===

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams.dec();
        self.duration.observe(self.start.elapsed().as_secs_f64());
    }
}
