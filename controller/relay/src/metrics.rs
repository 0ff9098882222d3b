use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use wafie_controller_core::relay::ProbeState;

#[derive(Clone, Debug)]
pub struct RelayMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
    probes: Family<ProbeLabels, Counter>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Action {
    Present,
    Absent,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ReconcileLabels {
    action: Action,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ProbeLabels {
    state: &'static str,
}

// === impl RelayMetrics ===

impl RelayMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::default();
        reg.register(
            "reconciles",
            "Total number of per-endpoint relay reconciliations, by outcome",
            reconciles.clone(),
        );

        let probes = Family::default();
        reg.register(
            "probes",
            "Total number of relay health probes, by observed state",
            probes.clone(),
        );

        Self { reconciles, probes }
    }

    pub(crate) fn reconciled(&self, action: Action, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.reconciles
            .get_or_create(&ReconcileLabels { action, result })
            .inc();
    }

    pub(crate) fn probed(&self, state: ProbeState) {
        let state = match state {
            ProbeState::Active => "active",
            ProbeState::Idle => "idle",
            ProbeState::Absent => "absent",
            ProbeState::Unknown => "unknown",
        };
        self.probes.get_or_create(&ProbeLabels { state }).inc();
    }

    #[cfg(test)]
    pub(crate) fn reconcile_count(&self, action: Action, ok: bool) -> u64 {
        let result = if ok { "ok" } else { "error" };
        self.reconciles
            .get_or_create(&ReconcileLabels { action, result })
            .get()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
