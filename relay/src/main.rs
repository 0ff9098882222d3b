#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod forward;
mod nft;
mod server;

use anyhow::Result;
use clap::Parser;
use futures::prelude::*;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tonic::{service::Routes, transport::Server};
use tracing::{debug, error, info, instrument, warn};
use wafie_api::v1::{relay_service_server::RelayServiceServer, RELAY_SERVICE};

use self::{
    nft::{NftCli, Programmer},
    server::RelayServer,
};

const NETNS_CHECK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[clap(
    name = "wafie-relay",
    about = "Redirects a pod's application traffic through the WAF gateway"
)]
struct Args {
    #[clap(long, default_value = "wafie=info,warn", env = "WAFIE_RELAY_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Address of the relay control API, inside the pod's network namespace.
    #[clap(long, default_value = "127.0.0.1:57812")]
    api_addr: SocketAddr,

    /// The network namespace this relay was started in. The relay exits once
    /// it is removed.
    #[clap(long)]
    netns: Option<PathBuf>,

    #[clap(long, default_value = "nft")]
    nft_binary: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        api_addr,
        netns,
        nft_binary,
    } = Args::parse();

    log_format.try_init(log_level)?;

    let (shutdown, drain) = kubert::shutdown::sigint_or_sigterm()?;

    let (reporter, health) = tonic_health::server::health_reporter();
    reporter
        .set_service_status(RELAY_SERVICE, tonic_health::ServingStatus::NotServing)
        .await;
    let relay = RelayServer::new(Programmer::new(NftCli::new(nft_binary)), reporter);

    let routes = Routes::new(health).add_service(RelayServiceServer::new(relay.clone()));
    let api = tokio::spawn(grpc(api_addr, routes, drain));

    tokio::select! {
        res = shutdown.signaled() => {
            if res.is_err() {
                warn!("Aborted");
            }
        }
        () = watch_netns(netns) => info!("Network namespace removed"),
    }

    // Leave nothing redirected to a relay that no longer listens.
    if let Err(status) = relay.stop().await {
        error!(%status, "Failed to stop relay");
    }
    api.abort();
    match api.await {
        Ok(res) => res,
        Err(_) => Ok(()),
    }
}

#[instrument(skip_all, fields(%addr))]
async fn grpc(addr: SocketAddr, routes: Routes, drain: kubert::shutdown::Watch) -> Result<()> {
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_routes(routes)
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!("Relay API listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

/// Completes once the namespace path no longer exists. Never completes if no
/// namespace was given.
async fn watch_netns(netns: Option<PathBuf>) {
    let Some(path) = netns else {
        return future::pending().await;
    };
    let mut interval = tokio::time::interval(NETNS_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => debug!(path = %path.display(), %error, "Failed to check namespace"),
        }
    }
}
