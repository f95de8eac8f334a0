//! Node-port forwarding: a host listener relaying TCP connections to a
//! workload's address.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A running forwarder. Dropping it stops accepting new connections.
#[derive(Debug)]
pub struct PortForwarder {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl PortForwarder {
    /// Binds `listen` and relays every accepted connection to `target`.
    pub async fn spawn(listen: SocketAddr, target: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, rx) = watch::channel(false);

        info!(listen = %local_addr, %target, "node port forwarder listening");
        tokio::spawn(accept_loop(listener, target, rx));

        Ok(PortForwarder {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, target: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((inbound, peer)) => {
                        tokio::spawn(relay(inbound, peer, target));
                    }
                    Err(e) => {
                        error!(error = %e, %target, "accept failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(%target, "node port forwarder stopped");
                    break;
                }
            }
        }
    }
}

async fn relay(mut inbound: TcpStream, peer: SocketAddr, target: SocketAddr) {
    let mut outbound = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, %target, error = %e, "workload unreachable");
            return;
        }
    };
    if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        debug!(%peer, %target, error = %e, "relay closed");
    }
}
