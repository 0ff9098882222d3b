//! Keeps the latest EndpointSlices and feeds them to the router.
//!
//! Slices are forwarded as they change, all of them again on every resync,
//! and those of specific services again whenever the set of protected
//! upstreams changes, so that a protection toggled in the policy store
//! reaches endpoints whose slices did not change.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, trace};
use wafie_controller_k8s_api::{
    endpoints::service_fqdn, EndpointSlice, Event, ResourceExt, Watch,
};

pub const RESYNC_PERIOD: Duration = Duration::from_secs(30);

type Key = (String, String);

#[derive(Debug)]
pub struct SliceInformer {
    slices: HashMap<Key, EndpointSlice>,
    /// Keys seen since the watch (re)started listing.
    listing: Option<HashSet<Key>>,
    tx: mpsc::Sender<EndpointSlice>,
    resync: Duration,
}

/// The router has gone away.
#[derive(Debug)]
struct Closed;

// === impl SliceInformer ===

impl SliceInformer {
    pub fn new(tx: mpsc::Sender<EndpointSlice>) -> Self {
        Self {
            slices: HashMap::new(),
            listing: None,
            tx,
            resync: RESYNC_PERIOD,
        }
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Runs until the receiving router stops.
    pub async fn run(
        mut self,
        mut slices: Watch<EndpointSlice>,
        mut upstreams: watch::Receiver<BTreeSet<String>>,
    ) {
        let mut resync = time::interval_at(time::Instant::now() + self.resync, self.resync);
        resync.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut upstreams_open = true;

        loop {
            let res = tokio::select! {
                biased;

                ev = slices.recv() => self.handle(ev).await,

                _ = resync.tick() => {
                    debug!(slices = self.slices.len(), "Resyncing");
                    self.replay(|_| true).await
                }

                changed = upstreams.changed(), if upstreams_open => match changed {
                    Ok(()) => {
                        let hosts = upstreams.borrow_and_update().clone();
                        debug!(upstreams = hosts.len(), "Protected upstreams changed");
                        self.replay(|fqdn| hosts.contains(fqdn)).await
                    }
                    Err(_) => {
                        upstreams_open = false;
                        Ok(())
                    }
                },
            };

            if res.is_err() {
                debug!("Router stopped");
                return;
            }
        }
    }

    async fn handle(&mut self, ev: Event<EndpointSlice>) -> Result<(), Closed> {
        match ev {
            Event::Init => {
                self.listing = Some(HashSet::new());
                Ok(())
            }
            Event::InitApply(slice) => {
                if let Some(listing) = self.listing.as_mut() {
                    listing.insert(key(&slice));
                }
                self.apply(slice).await
            }
            Event::InitDone => {
                if let Some(listing) = self.listing.take() {
                    self.slices.retain(|k, _| listing.contains(k));
                }
                Ok(())
            }
            Event::Apply(slice) => self.apply(slice).await,
            Event::Delete(slice) => {
                trace!(slice = %slice.name_any(), "Deleted");
                self.slices.remove(&key(&slice));
                Ok(())
            }
        }
    }

    async fn apply(&mut self, slice: EndpointSlice) -> Result<(), Closed> {
        self.slices.insert(key(&slice), slice.clone());
        self.tx.send(slice).await.map_err(|_| Closed)
    }

    async fn replay(&self, mut matches: impl FnMut(&str) -> bool) -> Result<(), Closed> {
        let slices = self
            .slices
            .values()
            .filter(|s| service_fqdn(s).is_some_and(|fqdn| matches(&fqdn)))
            .cloned()
            .collect::<Vec<_>>();
        for slice in slices {
            self.tx.send(slice).await.map_err(|_| Closed)?;
        }
        Ok(())
    }
}

fn key(slice: &EndpointSlice) -> Key {
    (slice.namespace().unwrap_or_default(), slice.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::prelude::*;
    use wafie_controller_k8s_api::{ObjectMeta, OwnerReference};

    fn mk_slice(name: &str, service: &str) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "Service".to_string(),
                    name: service.to_string(),
                    uid: service.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![],
            ports: None,
        }
    }

    fn mk_watch(events: fn() -> Vec<Event<EndpointSlice>>) -> Watch<EndpointSlice> {
        Watch::new(move || stream::iter(events().into_iter().map(Ok)).chain(stream::pending()))
    }

    async fn next_name(rx: &mut mpsc::Receiver<EndpointSlice>) -> String {
        rx.recv().await.expect("slice").name_any()
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_applied_slices_and_replays_upstreams() {
        let (tx, mut rx) = mpsc::channel(100);
        let (hosts_tx, hosts_rx) = watch::channel(BTreeSet::new());
        let slices = mk_watch(|| {
            vec![
                Event::Init,
                Event::InitApply(mk_slice("a-1", "a")),
                Event::InitApply(mk_slice("b-1", "b")),
                Event::InitDone,
            ]
        });
        tokio::spawn(SliceInformer::new(tx).run(slices, hosts_rx));

        assert_eq!(next_name(&mut rx).await, "a-1");
        assert_eq!(next_name(&mut rx).await, "b-1");

        hosts_tx
            .send(maplit::btreeset! {"b.default.svc".to_string()})
            .expect("informer running");
        assert_eq!(next_name(&mut rx).await, "b-1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn resyncs_cached_slices() {
        let (tx, mut rx) = mpsc::channel(100);
        let (_hosts_tx, hosts_rx) = watch::channel(BTreeSet::new());
        let slices = mk_watch(|| {
            vec![
                Event::Apply(mk_slice("a-1", "a")),
                Event::Apply(mk_slice("b-1", "b")),
                Event::Delete(mk_slice("a-1", "a")),
            ]
        });
        tokio::spawn(
            SliceInformer::new(tx)
                .with_resync(Duration::from_secs(30))
                .run(slices, hosts_rx),
        );

        assert_eq!(next_name(&mut rx).await, "a-1");
        assert_eq!(next_name(&mut rx).await, "b-1");

        time::sleep(Duration::from_secs(31)).await;
        assert_eq!(next_name(&mut rx).await, "b-1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn relist_forgets_vanished_slices() {
        let (tx, mut rx) = mpsc::channel(100);
        let (hosts_tx, hosts_rx) = watch::channel(BTreeSet::new());
        let slices = mk_watch(|| {
            vec![
                Event::Apply(mk_slice("a-1", "a")),
                Event::Init,
                Event::InitApply(mk_slice("b-1", "b")),
                Event::InitDone,
            ]
        });
        tokio::spawn(SliceInformer::new(tx).run(slices, hosts_rx));

        assert_eq!(next_name(&mut rx).await, "a-1");
        assert_eq!(next_name(&mut rx).await, "b-1");

        hosts_tx
            .send(maplit::btreeset! {"a.default.svc".to_string(), "b.default.svc".to_string()})
            .expect("informer running");
        assert_eq!(next_name(&mut rx).await, "b-1");
        assert!(rx.try_recv().is_err());
    }
}
