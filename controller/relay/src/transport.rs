//! Connections to endpoints that are only reachable from inside a pod's
//! network namespace.

use crate::netns::NetNs;
use hyper_util::rt::TokioIo;
use std::{
    error::Error,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};
use tokio::{
    net::{TcpSocket, TcpStream},
    time,
};
use tonic::transport::{Channel, Endpoint, Uri};

/// The relay control API, bound to loopback inside the pod.
pub const RELAY_API_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 57812));

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds gRPC channels whose connections originate inside a namespace.
#[derive(Clone, Debug)]
pub struct NamespacedTransport {
    netns: NetNs,
    timeout: Duration,
}

/// Opens a TCP connection to `addr` from inside `netns`.
///
/// Only socket creation happens in the namespace; the connect itself is
/// driven by the runtime as usual, since a socket stays bound to the
/// namespace it was created in.
pub async fn dial(netns: &NetNs, addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = netns
        .run(move || {
            if addr.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
        })
        .await
        .map_err(io::Error::other)??;

    time::timeout(DIAL_TIMEOUT, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
}

/// Whether any error in the chain is a refused TCP connection, meaning
/// nothing listens on the target address.
pub fn is_connection_refused(error: &(dyn Error + 'static)) -> bool {
    let mut next = Some(error);
    while let Some(err) = next {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        next = err.source();
    }
    false
}

// === impl NamespacedTransport ===

impl NamespacedTransport {
    pub fn new(netns: NetNs) -> Self {
        Self {
            netns,
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// Connects eagerly, so that an absent server surfaces here as a
    /// connection-refused error. Reconnects dial through the namespace
    /// again.
    pub async fn connect(&self) -> Result<Channel, tonic::transport::Error> {
        let netns = self.netns.clone();
        // The authority is only used for the `:authority` header.
        Endpoint::from_static("http://127.0.0.1:57812")
            .timeout(self.timeout)
            .connect_timeout(DIAL_TIMEOUT)
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let netns = netns.clone();
                async move { dial(&netns, RELAY_API_ADDR).await.map(TokioIo::new) }
            }))
            .await
    }
}
