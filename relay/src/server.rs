use crate::{
    forward::{self, Forwarder},
    nft::{Nft, Op, Programmer, Redirect},
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tonic_health::{server::HealthReporter, ServingStatus};
use tracing::{debug, info, instrument, warn};
use wafie_api::v1::{
    relay_service_server::RelayService, RelayOptions, StartRelayRequest, StartRelayResponse,
    StopRelayRequest, StopRelayResponse, RELAY_SERVICE,
};

/// Serves the relay control API.
///
/// The relay health service reports `SERVING` exactly while a forwarder is
/// running and the redirect is programmed.
#[derive(Clone)]
pub struct RelayServer<N> {
    inner: Arc<Inner<N>>,
}

struct Inner<N> {
    active: Mutex<Option<Active>>,
    programmer: Programmer<N>,
    health: HealthReporter,
    /// Address the forwarder binds; only its port is replaced by the
    /// requested relay port.
    listen: SocketAddr,
}

struct Active {
    options: Options,
    forwarder: Forwarder,
}

/// Validated start options.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Options {
    gateway_fqdn: String,
    gateway_port: u16,
    app_port: u16,
    relay_port: u16,
}

// === impl RelayServer ===

impl<N: Nft> RelayServer<N> {
    pub fn new(programmer: Programmer<N>, health: HealthReporter) -> Self {
        Self::with_listen_addr(programmer, health, SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    pub fn with_listen_addr(
        programmer: Programmer<N>,
        health: HealthReporter,
        listen: SocketAddr,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                active: Mutex::new(None),
                programmer,
                health,
                listen,
            }),
        }
    }

    #[cfg(test)]
    pub async fn is_forwarding(&self) -> bool {
        self.inner.active.lock().await.is_some()
    }

    #[instrument(skip_all, fields(gateway = %options.gateway_fqdn, app.port = options.app_port))]
    async fn start(&self, options: Options) -> Result<(), Status> {
        let mut active = self.inner.active.lock().await;
        if let Some(current) = active.as_ref() {
            if current.options == options {
                info!("Relay already forwarding");
                return Ok(());
            }
            info!("Relay options changed; restarting");
        }
        // Clears rules an earlier relay process may have left behind, which
        // would otherwise keep pointing at its relay port.
        self.deactivate(active.take()).await?;

        let gateways = forward::resolve(&options.gateway_fqdn, options.gateway_port)
            .await
            .map_err(|error| {
                Status::unavailable(format!("failed to resolve {}: {error}", options.gateway_fqdn))
            })?;
        if gateways.is_empty() {
            return Err(Status::unavailable(format!(
                "{} has no addresses",
                options.gateway_fqdn
            )));
        }

        let redirect = Redirect {
            gateway_ips: gateways
                .iter()
                .filter_map(|addr| match addr.ip() {
                    IpAddr::V4(ip) => Some(ip),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            app_port: options.app_port,
            relay_port: options.relay_port,
        };

        let mut listen = self.inner.listen;
        listen.set_port(options.relay_port);
        let forwarder = Forwarder::bind(listen, gateways)
            .await
            .map_err(|error| Status::internal(format!("failed to listen on {listen}: {error}")))?;

        if let Err(error) = self.inner.programmer.program(Op::Add(&redirect)).await {
            forwarder.stop();
            return Err(Status::internal(format!(
                "failed to program nftables: {error}"
            )));
        }

        let local_addr = forwarder.local_addr();
        *active = Some(Active { options, forwarder });
        self.inner
            .health
            .set_service_status(RELAY_SERVICE, ServingStatus::Serving)
            .await;
        info!(%local_addr, "Relay started");
        Ok(())
    }

    /// Stops forwarding and removes any owned redirect from the ruleset,
    /// including one programmed by an earlier relay process.
    pub async fn stop(&self) -> Result<(), Status> {
        let mut active = self.inner.active.lock().await;
        self.deactivate(active.take()).await
    }

    async fn deactivate(&self, active: Option<Active>) -> Result<(), Status> {
        let was_active = active.is_some();
        match active {
            Some(Active { forwarder, .. }) => {
                forwarder.stop();
                self.inner
                    .health
                    .set_service_status(RELAY_SERVICE, ServingStatus::NotServing)
                    .await;
            }
            None => debug!("Relay not forwarding"),
        }
        self.inner
            .programmer
            .program(Op::Delete)
            .await
            .map_err(|error| {
                warn!(%error, "Failed to remove nftables rules");
                Status::internal(format!("failed to unprogram nftables: {error}"))
            })?;
        if was_active {
            info!("Relay stopped");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<N: Nft> RelayService for RelayServer<N> {
    async fn start_relay(
        &self,
        req: Request<StartRelayRequest>,
    ) -> Result<Response<StartRelayResponse>, Status> {
        let options = req
            .into_inner()
            .options
            .ok_or_else(|| Status::invalid_argument("missing relay options"))
            .and_then(Options::try_from)?;
        self.start(options).await?;
        Ok(Response::new(StartRelayResponse {}))
    }

    async fn stop_relay(
        &self,
        _: Request<StopRelayRequest>,
    ) -> Result<Response<StopRelayResponse>, Status> {
        self.stop().await?;
        Ok(Response::new(StopRelayResponse {}))
    }
}

// === impl Options ===

impl TryFrom<RelayOptions> for Options {
    type Error = Status;

    fn try_from(options: RelayOptions) -> Result<Self, Self::Error> {
        fn port(name: &str, value: u32) -> Result<u16, Status> {
            match u16::try_from(value) {
                Ok(port) if port != 0 => Ok(port),
                _ => Err(Status::invalid_argument(format!("invalid {name}: {value}"))),
            }
        }

        if options.proxy_fqdn.is_empty() {
            return Err(Status::invalid_argument("missing proxy fqdn"));
        }
        Ok(Self {
            gateway_port: port("proxy listening port", options.proxy_listening_port)?,
            app_port: port("app container port", options.app_container_port)?,
            relay_port: port("relay port", options.relay_port)?,
            gateway_fqdn: options.proxy_fqdn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nft::{NftError, Transaction};
    use std::sync::Mutex as SyncMutex;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tonic::{
        service::Routes,
        transport::{Channel, Endpoint},
    };
    use tonic_health::pb::{
        health_check_response::ServingStatus as Reported, health_client::HealthClient,
        HealthCheckRequest,
    };

    #[derive(Clone, Default)]
    struct FakeNft {
        programmed: Arc<SyncMutex<bool>>,
        runs: Arc<SyncMutex<usize>>,
    }

    #[async_trait::async_trait]
    impl Nft for FakeNft {
        async fn chain_rules(&self) -> Result<Option<Vec<Option<String>>>, NftError> {
            let programmed = *self.programmed.lock().unwrap();
            Ok(programmed.then(|| vec![Some(crate::nft::OWNED_COMMENT.to_string())]))
        }

        async fn run(&self, tx: &Transaction) -> Result<(), NftError> {
            *self.runs.lock().unwrap() += 1;
            let added = tx.to_string().contains("add rule");
            *self.programmed.lock().unwrap() = added;
            Ok(())
        }
    }

    async fn echo_gateway() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        port
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn start_req(gateway_port: u16, relay_port: u16) -> Request<StartRelayRequest> {
        Request::new(StartRelayRequest {
            options: Some(RelayOptions {
                proxy_fqdn: "127.0.0.1".to_string(),
                proxy_listening_port: gateway_port.into(),
                app_container_port: 8080,
                relay_port: relay_port.into(),
            }),
        })
    }

    async fn serve_health(routes: Routes) -> HealthClient<Channel> {
        let port = free_port().await;
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_routes(routes)
                .serve(SocketAddr::from(([127, 0, 0, 1], port))),
        );
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{port}")).unwrap();
        for _ in 0..100 {
            if let Ok(channel) = endpoint.connect().await {
                return HealthClient::new(channel);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("health server did not start");
    }

    async fn relay_status(health: &mut HealthClient<Channel>) -> i32 {
        health
            .check(HealthCheckRequest {
                service: RELAY_SERVICE.to_string(),
            })
            .await
            .unwrap()
            .into_inner()
            .status
    }

    #[tokio::test]
    async fn start_and_stop() {
        let gateway_port = echo_gateway().await;
        let relay_port = free_port().await;
        let nft = FakeNft::default();
        let (reporter, health) = tonic_health::server::health_reporter();
        let mut health = serve_health(Routes::new(health)).await;
        let server = RelayServer::with_listen_addr(
            Programmer::new(nft.clone()),
            reporter,
            "127.0.0.1:0".parse().unwrap(),
        );

        server
            .start_relay(start_req(gateway_port, relay_port))
            .await
            .expect("start");
        assert!(server.is_forwarding().await);
        assert!(*nft.programmed.lock().unwrap());
        assert_eq!(relay_status(&mut health).await, Reported::Serving as i32);

        let mut conn = TcpStream::connect(("127.0.0.1", relay_port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Identical options change nothing.
        server
            .start_relay(start_req(gateway_port, relay_port))
            .await
            .expect("start");
        assert_eq!(*nft.runs.lock().unwrap(), 1);

        server
            .stop_relay(Request::new(StopRelayRequest {}))
            .await
            .expect("stop");
        assert!(!server.is_forwarding().await);
        assert!(!*nft.programmed.lock().unwrap());
        assert_eq!(*nft.runs.lock().unwrap(), 2);
        assert_eq!(relay_status(&mut health).await, Reported::NotServing as i32);
    }

    #[tokio::test]
    async fn stop_removes_rules_left_by_an_earlier_relay() {
        let nft = FakeNft::default();
        *nft.programmed.lock().unwrap() = true;
        let (reporter, _health) = tonic_health::server::health_reporter();
        let server = RelayServer::new(Programmer::new(nft.clone()), reporter);

        server
            .stop_relay(Request::new(StopRelayRequest {}))
            .await
            .expect("stop");
        assert!(!server.is_forwarding().await);
        assert!(!*nft.programmed.lock().unwrap());
        assert_eq!(*nft.runs.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn start_replaces_rules_left_by_an_earlier_relay() {
        let gateway_port = echo_gateway().await;
        let relay_port = free_port().await;
        let nft = FakeNft::default();
        *nft.programmed.lock().unwrap() = true;
        let (reporter, _health) = tonic_health::server::health_reporter();
        let server = RelayServer::with_listen_addr(
            Programmer::new(nft.clone()),
            reporter,
            "127.0.0.1:0".parse().unwrap(),
        );

        server
            .start_relay(start_req(gateway_port, relay_port))
            .await
            .expect("start");
        // Delete the stale table, then add ours.
        assert_eq!(*nft.runs.lock().unwrap(), 2);
        assert!(*nft.programmed.lock().unwrap());
        assert!(server.is_forwarding().await);
    }

    #[tokio::test]
    async fn restarts_when_options_change() {
        let gateway_port = echo_gateway().await;
        let nft = FakeNft::default();
        let (reporter, _health) = tonic_health::server::health_reporter();
        let server = RelayServer::with_listen_addr(
            Programmer::new(nft.clone()),
            reporter,
            "127.0.0.1:0".parse().unwrap(),
        );

        let first = free_port().await;
        server
            .start_relay(start_req(gateway_port, first))
            .await
            .expect("start");
        let second = free_port().await;
        server
            .start_relay(start_req(gateway_port, second))
            .await
            .expect("restart");

        // Add, delete, add.
        assert_eq!(*nft.runs.lock().unwrap(), 3);
        assert!(server.is_forwarding().await);
        TcpStream::connect(("127.0.0.1", second))
            .await
            .expect("forwarding on the new port");
    }

    #[tokio::test]
    async fn rejects_invalid_options() {
        let (reporter, _health) = tonic_health::server::health_reporter();
        let server = RelayServer::new(Programmer::new(FakeNft::default()), reporter);

        let status = server
            .start_relay(start_req(31000, 0))
            .await
            .expect_err("relay port is required");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = server
            .start_relay(Request::new(StartRelayRequest { options: None }))
            .await
            .expect_err("options are required");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let mut req = start_req(31000, 50010);
        if let Some(o) = req.get_mut().options.as_mut() {
            o.app_container_port = 70000;
        }
        let status = server.start_relay(req).await.expect_err("port range");
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(!server.is_forwarding().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let nft = FakeNft::default();
        let (reporter, _health) = tonic_health::server::health_reporter();
        let server = RelayServer::new(Programmer::new(nft.clone()), reporter);
        server.stop().await.expect("stop");
        assert_eq!(*nft.runs.lock().unwrap(), 0);
    }
}
