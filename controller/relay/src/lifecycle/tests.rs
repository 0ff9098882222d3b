use super::*;
use anyhow::bail;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use wafie_controller_core::relay::ContainerRuntime;

#[derive(Clone, Default)]
struct FakeNode {
    state: Arc<Mutex<NodeState>>,
}

#[derive(Default)]
struct NodeState {
    /// Pod name to container id.
    pods: HashMap<String, String>,
    /// Relays by namespace path; `true` while forwarding.
    relays: HashMap<PathBuf, bool>,
    unknown: bool,
    /// StartRelay calls that fail after a spawn before the API is up.
    not_ready: u32,
    spawns: usize,
    starts: usize,
    stops: usize,
    probes: usize,
}

#[async_trait::async_trait]
impl Workloads for FakeNode {
    async fn container(&self, pod: &PodRef) -> Result<ContainerRef> {
        let id = self.state.lock().pods.get(&pod.name).cloned();
        match id {
            Some(id) => Ok(ContainerRef {
                runtime: ContainerRuntime::Containerd,
                id,
            }),
            None => bail!("pod {pod} not found"),
        }
    }
}

#[async_trait::async_trait]
impl NetnsResolver for FakeNode {
    async fn network_namespace(&self, container: &ContainerRef) -> Result<PathBuf> {
        Ok(PathBuf::from(format!("/var/run/netns/cni-{}", container.id)))
    }
}

#[async_trait::async_trait]
impl RelayInstances for FakeNode {
    async fn probe(&self, netns: &Path) -> ProbeState {
        let mut state = self.state.lock();
        state.probes += 1;
        if state.unknown {
            return ProbeState::Unknown;
        }
        match state.relays.get(netns) {
            None => ProbeState::Absent,
            Some(false) => ProbeState::Idle,
            Some(true) => ProbeState::Active,
        }
    }

    async fn spawn(&self, instance: &RelayInstanceSpec) -> Result<()> {
        let mut state = self.state.lock();
        state.spawns += 1;
        state.relays.insert(instance.netns.clone(), false);
        Ok(())
    }

    async fn start(&self, netns: &Path, _: &RelayOptions) -> Result<()> {
        let mut state = self.state.lock();
        state.starts += 1;
        if state.not_ready > 0 {
            state.not_ready -= 1;
            bail!("connection refused");
        }
        match state.relays.get_mut(netns) {
            Some(forwarding) => {
                *forwarding = true;
                Ok(())
            }
            None => bail!("connection refused"),
        }
    }

    async fn stop(&self, netns: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.stops += 1;
        if let Some(forwarding) = state.relays.get_mut(netns) {
            *forwarding = false;
        }
        Ok(())
    }
}

fn mk_controller(node: &FakeNode) -> RelayController<FakeNode, FakeNode, FakeNode> {
    node.state
        .lock()
        .pods
        .insert("demo-1".to_string(), "abc".to_string());
    RelayController::new(
        node.clone(),
        node.clone(),
        node.clone(),
        "node-a",
        RelayMetrics::default(),
    )
    .with_start_backoff(Backoff::Fixed(Duration::from_millis(100)), 5)
}

fn pod() -> PodRef {
    PodRef {
        namespace: "default".to_string(),
        name: "demo-1".to_string(),
    }
}

fn options() -> RelayOptions {
    RelayOptions {
        gateway_fqdn: "appsecgw.default.svc".to_string(),
        gateway_port: 31000,
        app_port: 8080,
        relay_port: 50010,
    }
}

fn netns() -> PathBuf {
    PathBuf::from("/var/run/netns/cni-abc")
}

#[tokio::test(start_paused = true)]
async fn spawns_and_starts_absent_relay() {
    let node = FakeNode::default();
    let controller = mk_controller(&node);

    controller
        .ensure_present(&pod(), &options())
        .await
        .expect("ensure present");

    assert_eq!(node.probe(&netns()).await, ProbeState::Active);
    let state = node.state.lock();
    assert_eq!(state.spawns, 1);
    assert_eq!(state.starts, 1);
    assert_eq!(state.stops, 0);
}

#[tokio::test(start_paused = true)]
async fn ensure_present_is_idempotent() {
    let node = FakeNode::default();
    let controller = mk_controller(&node);

    for _ in 0..3 {
        controller
            .ensure_present(&pod(), &options())
            .await
            .expect("ensure present");
    }

    let state = node.state.lock();
    assert_eq!(state.spawns, 1);
    assert_eq!(state.starts, 1);
    assert_eq!(state.relays.len(), 1);
    assert_eq!(controller.metrics.reconcile_count(Action::Present, true), 3);
}

#[tokio::test(start_paused = true)]
async fn retries_start_until_relay_binds() {
    let node = FakeNode::default();
    node.state.lock().not_ready = 3;
    let controller = mk_controller(&node);

    let t0 = tokio::time::Instant::now();
    controller
        .ensure_present(&pod(), &options())
        .await
        .expect("ensure present");

    assert_eq!(t0.elapsed(), Duration::from_millis(300));
    let state = node.state.lock();
    assert_eq!(state.spawns, 1);
    assert_eq!(state.starts, 4);
    assert_eq!(state.relays.get(&netns()), Some(&true));
}

#[tokio::test(start_paused = true)]
async fn gives_up_when_relay_never_binds() {
    let node = FakeNode::default();
    node.state.lock().not_ready = 100;
    let controller = mk_controller(&node);

    controller
        .ensure_present(&pod(), &options())
        .await
        .expect_err("relay never accepts StartRelay");

    let state = node.state.lock();
    assert_eq!(state.spawns, 1);
    assert_eq!(state.starts, 5);
    drop(state);
    assert_eq!(controller.metrics.reconcile_count(Action::Present, false), 1);
}

#[tokio::test]
async fn starts_idle_relay_without_spawning() {
    let node = FakeNode::default();
    node.state.lock().relays.insert(netns(), false);
    let controller = mk_controller(&node);

    controller
        .ensure_present(&pod(), &options())
        .await
        .expect("ensure present");

    let state = node.state.lock();
    assert_eq!(state.spawns, 0);
    assert_eq!(state.starts, 1);
    assert_eq!(state.relays.get(&netns()), Some(&true));
}

#[tokio::test]
async fn unknown_state_is_left_alone_when_enabling() {
    let node = FakeNode::default();
    node.state.lock().unknown = true;
    let controller = mk_controller(&node);

    controller
        .ensure_present(&pod(), &options())
        .await
        .expect("ensure present");

    let state = node.state.lock();
    assert_eq!(state.spawns, 0);
    assert_eq!(state.starts, 0);
}

#[tokio::test]
async fn stops_active_relay_without_killing_it() {
    let node = FakeNode::default();
    node.state.lock().relays.insert(netns(), true);
    let controller = mk_controller(&node);

    controller.ensure_absent(&pod()).await.expect("ensure absent");
    // The process survives, idle.
    assert_eq!(node.probe(&netns()).await, ProbeState::Idle);

    controller.ensure_absent(&pod()).await.expect("ensure absent");
    let state = node.state.lock();
    assert_eq!(state.stops, 1);
    assert_eq!(state.spawns, 0);
    assert_eq!(state.relays.len(), 1);
}

#[tokio::test]
async fn stops_relay_in_unknown_state() {
    let node = FakeNode::default();
    node.state.lock().unknown = true;
    let controller = mk_controller(&node);

    controller.ensure_absent(&pod()).await.expect("ensure absent");
    assert_eq!(node.state.lock().stops, 1);
}

#[tokio::test]
async fn absent_relay_needs_nothing() {
    let node = FakeNode::default();
    let controller = mk_controller(&node);

    controller.ensure_absent(&pod()).await.expect("ensure absent");
    let state = node.state.lock();
    assert_eq!(state.stops, 0);
    assert_eq!(state.spawns, 0);
}

#[tokio::test]
async fn unresolvable_pods_fail_without_probing() {
    let node = FakeNode::default();
    let controller = mk_controller(&node);
    let missing = PodRef {
        namespace: "default".to_string(),
        name: "gone".to_string(),
    };

    controller
        .ensure_present(&missing, &options())
        .await
        .expect_err("pod does not exist");
    controller
        .ensure_absent(&missing)
        .await
        .expect_err("pod does not exist");

    assert_eq!(node.state.lock().probes, 0);
    assert_eq!(controller.metrics.reconcile_count(Action::Absent, false), 1);
}
