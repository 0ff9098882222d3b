use crate::{
    model::{Protection, ProtectionFilter, StateType},
    store::PolicyStore,
};
use anyhow::Result;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

/// Lists protections whenever the store's version token changes.
///
/// Each pipeline owns its own poller so that they progress independently.
#[derive(Debug)]
pub struct VersionPoller<S> {
    store: S,
    filter: ProtectionFilter,
    last_seen: Option<String>,
}

// === impl VersionPoller ===

impl<S: PolicyStore> VersionPoller<S> {
    pub fn new(store: S, filter: ProtectionFilter) -> Self {
        Self {
            store,
            filter,
            last_seen: None,
        }
    }

    pub fn last_seen(&self) -> Option<&str> {
        self.last_seen.as_deref()
    }

    /// Returns the current protections if the version token moved since the
    /// last successful poll.
    ///
    /// The token is only recorded once the list has been fetched, so a failed
    /// list is retried on the next poll.
    pub async fn poll(&mut self) -> Result<Option<Vec<Protection>>> {
        let version = self.store.state_version(StateType::Protection).await?;
        if self.last_seen.as_deref() == Some(version.as_str()) {
            return Ok(None);
        }

        let protections = self.store.list_protections(self.filter.clone()).await?;
        debug!(%version, protections = protections.len(), "Protection state changed");
        self.last_seen = Some(version);
        Ok(Some(protections))
    }

    /// Polls on a fixed interval, handing every change to `on_change`.
    ///
    /// Errors are logged and retried on the next tick; this never returns.
    pub async fn run<F>(mut self, interval: Duration, mut on_change: F)
    where
        F: FnMut(Vec<Protection>),
    {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        info!(?interval, "Polling protection state");
        loop {
            ticks.tick().await;
            match self.poll().await {
                Ok(Some(protections)) => on_change(protections),
                Ok(None) => {}
                Err(error) => warn!(%error, "Failed to poll protection state"),
            }
        }
    }
}
