//! State-of-the-world xDS discovery served from the snapshot cache.

use crate::{envoy, metrics::XdsMetrics};
use envoy_types::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::{
        ClusterDiscoveryService, ClusterDiscoveryServiceServer,
    },
    discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    endpoint::v3::endpoint_discovery_service_server::{
        EndpointDiscoveryService, EndpointDiscoveryServiceServer,
    },
    listener::v3::listener_discovery_service_server::{
        ListenerDiscoveryService, ListenerDiscoveryServiceServer,
    },
    route::v3::route_discovery_service_server::{
        RouteDiscoveryService, RouteDiscoveryServiceServer,
    },
    runtime::v3::runtime_discovery_service_server::{
        RuntimeDiscoveryService, RuntimeDiscoveryServiceServer,
    },
    secret::v3::secret_discovery_service_server::{
        SecretDiscoveryService, SecretDiscoveryServiceServer,
    },
};
use futures::prelude::*;
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use wafie_controller_core::xds::{Snapshot, SnapshotCache};

pub mod type_url {
    pub const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    pub const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    pub const ROUTE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
    pub const ENDPOINT: &str = "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
    pub const SECRET: &str = "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
    pub const RUNTIME: &str = "type.googleapis.com/envoy.service.runtime.v3.Runtime";
}

/// Serves ADS and the typed discovery services for every proxy node found in
/// the cache.
#[derive(Clone, Debug)]
pub struct DiscoveryServer {
    cache: SnapshotCache,
    drain: drain::Watch,
    metrics: XdsMetrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ResourceType {
    Listener,
    Cluster,
    Route,
    Endpoint,
    Secret,
    Runtime,
}

/// Per-stream protocol state: what each resource type was last sent and the
/// nonce the proxy must echo back.
#[derive(Debug)]
pub(crate) struct Subscriptions {
    types: HashMap<ResourceType, Subscription>,
    nonces: u64,
    metrics: XdsMetrics,
}

#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    nonce: Option<String>,
    sent_version: Option<String>,
}

type BoxDiscoveryStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

type BoxDeltaStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, tonic::Status>> + Send>>;

type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

// === impl DiscoveryServer ===

impl DiscoveryServer {
    pub fn new(cache: SnapshotCache, metrics: XdsMetrics, drain: drain::Watch) -> Self {
        Self {
            cache,
            drain,
            metrics,
        }
    }

    /// All discovery services, ready to be mounted on a server.
    pub fn routes(self) -> tonic::service::Routes {
        tonic::service::Routes::new(AggregatedDiscoveryServiceServer::new(self.clone()))
            .add_service(ListenerDiscoveryServiceServer::new(self.clone()))
            .add_service(ClusterDiscoveryServiceServer::new(self.clone()))
            .add_service(RouteDiscoveryServiceServer::new(self.clone()))
            .add_service(EndpointDiscoveryServiceServer::new(self.clone()))
            .add_service(SecretDiscoveryServiceServer::new(self.clone()))
            .add_service(RuntimeDiscoveryServiceServer::new(self))
    }

    /// Serves a state-of-the-world stream. Typed services pin the resource
    /// type; ADS takes it from each request.
    fn sotw(
        &self,
        fixed: Option<ResourceType>,
        mut requests: tonic::Streaming<DiscoveryRequest>,
    ) -> BoxDiscoveryStream {
        let cache = self.cache.clone();
        let drain = self.drain.clone();
        let mut subs = Subscriptions::new(self.metrics.clone());
        let guard = self.metrics.stream();

        Box::pin(async_stream::try_stream! {
            let _guard = guard;
            let mut snapshots: Option<SnapshotRx> = None;
            tokio::pin! {
                let shutdown = drain.signaled();
            }

            // `?` is not rewritten by `try_stream!` inside `select!`, so
            // errors break out of the loop and are raised below.
            let err = loop {
                tokio::select! {
                    req = requests.message() => {
                        let req = match req {
                            Ok(Some(req)) => req,
                            Ok(None) => return,
                            Err(status) => {
                                debug!(%status, "Discovery stream failed");
                                return;
                            }
                        };

                        if snapshots.is_none() {
                            let node = match node_id(&req) {
                                Ok(node) => node,
                                Err(status) => break status,
                            };
                            info!(%node, "Proxy connected");
                            snapshots = Some(cache.watch(&node));
                        }
                        let current = snapshots.as_ref().and_then(|rx| rx.borrow().clone());
                        if let Some(rsp) = subs.handle_request(fixed, req, current.as_deref()) {
                            yield rsp;
                        }
                    }

                    // When a new snapshot is published, push every subscribed type
                    // that the proxy has not seen at this version.
                    Some(snapshot) = next_snapshot(&mut snapshots) => {
                        for rsp in subs.handle_snapshot(&snapshot) {
                            yield rsp;
                        }
                    }

                    // If the server starts shutting down, close the stream so that it doesn't hold
                    // the server open.
                    _ = (&mut shutdown) => {
                        return;
                    }
                }
            };
            Err::<(), _>(err)?;
        })
    }

    fn fetch(
        &self,
        ty: ResourceType,
        req: DiscoveryRequest,
    ) -> Result<tonic::Response<DiscoveryResponse>, tonic::Status> {
        let node = node_id(&req)?;
        let snapshot = self
            .cache
            .get(&node)
            .ok_or_else(|| tonic::Status::unavailable("no configuration for node"))?;
        let mut subs = Subscriptions::new(self.metrics.clone());
        let rsp = subs.respond(ty, &req.resource_names, &snapshot);
        Ok(tonic::Response::new(rsp))
    }
}

fn node_id(req: &DiscoveryRequest) -> Result<String, tonic::Status> {
    req.node
        .as_ref()
        .map(|n| n.id.clone())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| tonic::Status::invalid_argument("request must identify the proxy node"))
}

/// Resolves with the next published snapshot. Never resolves before the
/// stream has identified its node.
async fn next_snapshot(rx: &mut Option<SnapshotRx>) -> Option<Arc<Snapshot>> {
    match rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                return future::pending().await;
            }
            rx.borrow_and_update().clone()
        }
        None => future::pending().await,
    }
}

fn delta_unimplemented() -> Result<tonic::Response<BoxDeltaStream>, tonic::Status> {
    Err(tonic::Status::unimplemented(
        "incremental xDS is not supported",
    ))
}

#[async_trait::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = BoxDiscoveryStream;

    async fn stream_aggregated_resources(
        &self,
        req: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxDiscoveryStream>, tonic::Status> {
        Ok(tonic::Response::new(self.sotw(None, req.into_inner())))
    }

    type DeltaAggregatedResourcesStream = BoxDeltaStream;

    async fn delta_aggregated_resources(
        &self,
        _req: tonic::Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxDeltaStream>, tonic::Status> {
        delta_unimplemented()
    }
}

/// Implements a typed discovery service in terms of the shared stream and
/// fetch handlers.
macro_rules! typed_discovery_service {
    (
        $svc:ident, $ty:expr,
        $stream_ty:ident => $stream:ident,
        $delta_ty:ident => $delta:ident,
        $fetch:ident
    ) => {
        #[async_trait::async_trait]
        impl $svc for DiscoveryServer {
            type $stream_ty = BoxDiscoveryStream;

            async fn $stream(
                &self,
                req: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
            ) -> Result<tonic::Response<BoxDiscoveryStream>, tonic::Status> {
                Ok(tonic::Response::new(self.sotw(Some($ty), req.into_inner())))
            }

            type $delta_ty = BoxDeltaStream;

            async fn $delta(
                &self,
                _req: tonic::Request<tonic::Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<tonic::Response<BoxDeltaStream>, tonic::Status> {
                delta_unimplemented()
            }

            async fn $fetch(
                &self,
                req: tonic::Request<DiscoveryRequest>,
            ) -> Result<tonic::Response<DiscoveryResponse>, tonic::Status> {
                self.fetch($ty, req.into_inner())
            }
        }
    };
}

typed_discovery_service!(
    ListenerDiscoveryService, ResourceType::Listener,
    StreamListenersStream => stream_listeners,
    DeltaListenersStream => delta_listeners,
    fetch_listeners
);

typed_discovery_service!(
    ClusterDiscoveryService, ResourceType::Cluster,
    StreamClustersStream => stream_clusters,
    DeltaClustersStream => delta_clusters,
    fetch_clusters
);

typed_discovery_service!(
    RouteDiscoveryService, ResourceType::Route,
    StreamRoutesStream => stream_routes,
    DeltaRoutesStream => delta_routes,
    fetch_routes
);

typed_discovery_service!(
    EndpointDiscoveryService, ResourceType::Endpoint,
    StreamEndpointsStream => stream_endpoints,
    DeltaEndpointsStream => delta_endpoints,
    fetch_endpoints
);

typed_discovery_service!(
    SecretDiscoveryService, ResourceType::Secret,
    StreamSecretsStream => stream_secrets,
    DeltaSecretsStream => delta_secrets,
    fetch_secrets
);

typed_discovery_service!(
    RuntimeDiscoveryService, ResourceType::Runtime,
    StreamRuntimeStream => stream_runtime,
    DeltaRuntimeStream => delta_runtime,
    fetch_runtime
);

// === impl ResourceType ===

impl ResourceType {
    /// Clusters and their endpoints go out before the listeners and routes
    /// that reference them.
    const PUSH_ORDER: [Self; 6] = [
        Self::Cluster,
        Self::Endpoint,
        Self::Listener,
        Self::Route,
        Self::Secret,
        Self::Runtime,
    ];

    pub(crate) fn from_type_url(url: &str) -> Option<Self> {
        match url {
            type_url::LISTENER => Some(Self::Listener),
            type_url::CLUSTER => Some(Self::Cluster),
            type_url::ROUTE => Some(Self::Route),
            type_url::ENDPOINT => Some(Self::Endpoint),
            type_url::SECRET => Some(Self::Secret),
            type_url::RUNTIME => Some(Self::Runtime),
            _ => None,
        }
    }

    pub(crate) fn type_url(&self) -> &'static str {
        match self {
            Self::Listener => type_url::LISTENER,
            Self::Cluster => type_url::CLUSTER,
            Self::Route => type_url::ROUTE,
            Self::Endpoint => type_url::ENDPOINT,
            Self::Secret => type_url::SECRET,
            Self::Runtime => type_url::RUNTIME,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Cluster => "cluster",
            Self::Route => "route",
            Self::Endpoint => "endpoint",
            Self::Secret => "secret",
            Self::Runtime => "runtime",
        }
    }
}

// === impl Subscriptions ===

impl Subscriptions {
    pub(crate) fn new(metrics: XdsMetrics) -> Self {
        Self {
            types: HashMap::new(),
            nonces: 0,
            metrics,
        }
    }

    /// Handles a request from the proxy, returning a response when the proxy
    /// is missing the current snapshot.
    ///
    /// Requests echoing an old nonce are ignored. A rejection is recorded and
    /// nothing is resent until the next snapshot.
    pub(crate) fn handle_request(
        &mut self,
        fixed: Option<ResourceType>,
        req: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
    ) -> Option<DiscoveryResponse> {
        let Some(ty) = fixed.or_else(|| ResourceType::from_type_url(&req.type_url)) else {
            warn!(type_url = %req.type_url, "Unsupported resource type");
            return None;
        };

        let sub = self.types.entry(ty).or_default();
        let initial = req.response_nonce.is_empty();
        if !initial && sub.nonce.as_deref() != Some(req.response_nonce.as_str()) {
            debug!(resource = ty.as_str(), nonce = %req.response_nonce, "Ignoring stale request");
            return None;
        }

        if let Some(status) = req.error_detail {
            warn!(
                resource = ty.as_str(),
                version = %req.version_info,
                error = %status.message,
                "Proxy rejected configuration"
            );
            self.metrics.nack(ty.as_str());
            sub.names = req.resource_names;
            return None;
        }

        let names_changed = sub.names != req.resource_names;
        sub.names = req.resource_names;
        let snapshot = snapshot?;
        if !initial
            && !names_changed
            && sub.sent_version.as_deref() == Some(snapshot.version.as_str())
        {
            debug!(resource = ty.as_str(), version = %req.version_info, "Acknowledged");
            return None;
        }

        let names = sub.names.clone();
        Some(self.respond(ty, &names, snapshot))
    }

    /// Returns a response for every subscribed type that was not yet sent
    /// this snapshot's version, clusters first.
    pub(crate) fn handle_snapshot(&mut self, snapshot: &Snapshot) -> Vec<DiscoveryResponse> {
        let stale = ResourceType::PUSH_ORDER
            .into_iter()
            .filter_map(|ty| {
                let sub = self.types.get(&ty)?;
                (sub.sent_version.as_deref() != Some(snapshot.version.as_str()))
                    .then(|| (ty, sub.names.clone()))
            })
            .collect::<Vec<_>>();
        stale
            .into_iter()
            .map(|(ty, names)| self.respond(ty, &names, snapshot))
            .collect()
    }

    fn respond(
        &mut self,
        ty: ResourceType,
        names: &[String],
        snapshot: &Snapshot,
    ) -> DiscoveryResponse {
        self.nonces += 1;
        let nonce = self.nonces.to_string();
        let sub = self.types.entry(ty).or_default();
        sub.nonce = Some(nonce.clone());
        sub.sent_version = Some(snapshot.version.clone());
        self.metrics.response(ty.as_str());
        debug!(resource = ty.as_str(), version = %snapshot.version, %nonce, "Sending resources");

        DiscoveryResponse {
            version_info: snapshot.version.clone(),
            resources: envoy::resources(snapshot, ty, names),
            type_url: ty.type_url().to_string(),
            nonce,
            ..Default::default()
        }
    }
}
