use crate::{
    core::{
        resources::GatewayConfig,
        xds::{SnapshotApplier, SnapshotCache, WafFilter},
    },
    grpc::{DiscoveryServer, GrpcPolicyStore, XdsMetrics},
    k8s::{self, watcher, Watch},
    pipeline,
    relay::{
        CriResolver, EndpointRouter, NamespacedRelays, PodWorkloads, RelayController,
        RelayMetrics, SliceInformer,
    },
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{collections::BTreeSet, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

// Slices buffered between the informer and the router.
const SLICE_QUEUE_SIZE: usize = 100;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_CONNECTION_AGE: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Parser)]
#[clap(name = "wafie-controller", about = "A WAF gateway control plane")]
pub struct Args {
    #[clap(
        long,
        default_value = "wafie=info,warn",
        env = "WAFIE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address of the policy store API.
    #[clap(long, default_value = "http://localhost:8080", env = "WAFIE_API_ADDR")]
    api_addr: String,

    #[clap(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Disables the gateway xDS server.
    #[clap(long)]
    xds_disabled: bool,

    #[clap(long, default_value = "0.0.0.0:18000")]
    xds_addr: SocketAddr,

    /// The node id the gateway proxy presents in discovery requests.
    #[clap(long, default_value = "node-1")]
    xds_node_id: String,

    /// Serves listeners without the WAF filter.
    #[clap(long)]
    waf_disabled: bool,

    #[clap(long, default_value = "wafie-v1")]
    waf_library_id: String,

    #[clap(long, default_value = "/usr/local/lib/wafie-modsec.so")]
    waf_library_path: String,

    #[clap(long, default_value = "wafie")]
    waf_plugin_name: String,

    /// Disables relay injection on this node.
    #[clap(long)]
    relay_disabled: bool,

    /// The node this controller reconciles relays on.
    #[clap(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// DNS name of the gateway proxy service that relays forward to.
    #[clap(long, default_value = "appsecgw.default.svc")]
    gateway_fqdn: String,

    #[clap(long, default_value = "50010")]
    relay_port: u16,

    #[clap(long, default_value = "/usr/local/bin/wafie-relay")]
    relay_binary: PathBuf,

    /// Where the host filesystem is mounted, if not at `/`.
    #[clap(long)]
    host_root: Option<PathBuf>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            api_addr,
            poll_interval_ms,
            xds_disabled,
            xds_addr,
            xds_node_id,
            waf_disabled,
            waf_library_id,
            waf_library_path,
            waf_plugin_name,
            relay_disabled,
            node_name,
            gateway_fqdn,
            relay_port,
            relay_binary,
            host_root,
        } = self;

        let poll_interval = Duration::from_millis(poll_interval_ms);
        let node_name = match (relay_disabled, node_name) {
            (true, _) => None,
            (false, Some(name)) => Some(name),
            (false, None) => bail!("--node-name is required unless --relay-disabled is set"),
        };

        // The policy store client is the only state shared by both pipelines.
        let store = Arc::new(
            GrpcPolicyStore::connect_lazy(api_addr).context("invalid policy store address")?,
        );

        let mut prom = <Registry>::default();
        let xds_metrics = XdsMetrics::register(prom.sub_registry_with_prefix("xds"));
        let relay_metrics = RelayMetrics::register(prom.sub_registry_with_prefix("relay"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        if xds_disabled {
            info!("xDS server disabled");
        } else {
            let waf = (!waf_disabled).then_some(WafFilter {
                library_id: waf_library_id,
                library_path: waf_library_path,
                plugin_name: waf_plugin_name,
            });
            let config = GatewayConfig {
                waf,
                ..GatewayConfig::default()
            };

            let cache = SnapshotCache::default();
            let applier = SnapshotApplier::new(cache.clone(), xds_node_id, config);
            tokio::spawn(
                pipeline::gateway(store.clone(), applier, xds_metrics.clone(), poll_interval)
                    .instrument(info_span!("gateway")),
            );

            let server = DiscoveryServer::new(cache, xds_metrics, runtime.shutdown_handle());
            tokio::spawn(grpc(xds_addr, server, runtime.shutdown_handle()));
        }

        if let Some(node_name) = node_name {
            let (upstreams_tx, upstreams_rx) = watch::channel(BTreeSet::new());
            tokio::spawn(
                pipeline::upstreams(store.clone(), upstreams_tx, poll_interval)
                    .instrument(info_span!("upstreams")),
            );

            let (slices_tx, slices_rx) = mpsc::channel(SLICE_QUEUE_SIZE);
            let slices =
                Watch::<k8s::EndpointSlice>::all(runtime.client(), watcher::Config::default())
                    .instrument(info_span!("endpointslices"));
            tokio::spawn(
                SliceInformer::new(slices_tx)
                    .run(slices, upstreams_rx)
                    .instrument(info_span!("informer")),
            );

            let controller = RelayController::new(
                PodWorkloads::new(runtime.client()),
                CriResolver::new(host_root),
                NamespacedRelays::new(relay_binary),
                node_name.clone(),
                relay_metrics,
            );
            let router =
                EndpointRouter::new(store, controller, node_name, gateway_fqdn, relay_port);
            tokio::spawn(
                router
                    .run(slices_rx, runtime.shutdown_handle())
                    .instrument(info_span!("router")),
            );
        } else {
            info!("Relay injection disabled");
        }

        // Runs until a shutdown signal, then waits for drained tasks.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(addr: SocketAddr, server: DiscoveryServer, drain: drain::Watch) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
            .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
            .max_connection_age(MAX_CONNECTION_AGE)
            .add_routes(server.routes())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
