use rand::seq::SliceRandom;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, warn, Instrument};

/// Accepts connections on the relay port and pipes each one to a gateway
/// address picked at random.
///
/// Forwarding stops, and the listening socket is closed, when the forwarder
/// is stopped or dropped. Connections already established are left to finish.
#[derive(Debug)]
pub struct Forwarder {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Resolves the gateway service's addresses.
pub async fn resolve(fqdn: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs = tokio::net::lookup_host((fqdn, port)).await?.collect();
    Ok(addrs)
}

// === impl Forwarder ===

impl Forwarder {
    pub async fn bind(addr: SocketAddr, gateways: Vec<SocketAddr>) -> io::Result<Self> {
        if gateways.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no gateway addresses",
            ));
        }
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, gateways = gateways.len(), "Forwarding");
        let task = tokio::spawn(
            accept(listener, Arc::new(gateways)).instrument(info_span!("forward", %local_addr)),
        );
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(self) {
        debug!(local_addr = %self.local_addr, "Stopping forwarder");
        // Dropping aborts the accept task.
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept(listener: TcpListener, gateways: Arc<Vec<SocketAddr>>) {
    loop {
        let (client, client_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "Failed to accept connection");
                continue;
            }
        };
        let gateway = match gateways.choose(&mut rand::thread_rng()) {
            Some(addr) => *addr,
            None => return,
        };
        tokio::spawn(
            forward(client, gateway).instrument(info_span!("conn", client.addr = %client_addr)),
        );
    }
}

async fn forward(mut client: TcpStream, gateway: SocketAddr) {
    let mut upstream = match TcpStream::connect(gateway).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%gateway, %error, "Failed to connect to gateway");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(%gateway, sent, received, "Connection closed"),
        Err(error) => debug!(%gateway, %error, "Connection failed"),
    }
}
