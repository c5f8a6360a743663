//! UDP intake: every datagram is one request body.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::{IngestPipeline, Outcome};

const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpListener {
    socket: UdpSocket,
    pipeline: Arc<IngestPipeline>,
}

impl UdpListener {
    pub async fn bind(addr: &str, pipeline: Arc<IngestPipeline>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket, pipeline })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until `stop` flips to true or its sender is dropped
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let addr = self.local_addr().map(|a| a.to_string()).unwrap_or_default();
        tracing::info!(input = %self.pipeline.name(), addr = %addr, "UDP listener started");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, peer)) => {
                            let pipeline = Arc::clone(&self.pipeline);
                            let data = buf[..n].to_vec();
                            tokio::spawn(async move {
                                match pipeline.handle_datagram(data).await {
                                    Ok(Outcome::Dropped) => {
                                        tracing::warn!(peer = %peer, "Datagram dropped");
                                    }
                                    Ok(outcome) => {
                                        tracing::debug!(peer = %peer, bytes = n, outcome = ?outcome, "Datagram handled");
                                    }
                                    Err(e) => {
                                        tracing::warn!(peer = %peer, "Datagram rejected: {}", e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "UDP receive error");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        tracing::info!(input = %self.pipeline.name(), "UDP listener stopped");
    }
}
