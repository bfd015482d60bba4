//! The shared SIP UDP socket.
//!
//! One socket per process. Writes serialize through a queue so responses
//! and requests from different tasks never interleave mid-datagram; reads
//! fan out through the dispatcher. On repeated receive errors the socket is
//! closed and re-bound, and the registration engine is told to re-register
//! after a short settle.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Consecutive receive errors tolerated before re-binding.
const MAX_SOCKET_ERRORS: u32 = 3;
/// Settle delay between a successful re-bind and re-registration.
const REBIND_SETTLE: Duration = Duration::from_secs(2);

/// Seam for everything that emits SIP datagrams. Tests record; production
/// goes through the shared socket's write queue.
#[async_trait]
pub trait SipSender: Send + Sync + 'static {
    async fn send(&self, target: SocketAddr, payload: Bytes);
}

/// An inbound SIP datagram with its source address.
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    pub payload: Bytes,
    pub peer: SocketAddr,
}

/// Handle to the shared socket's write queue.
#[derive(Clone)]
pub struct UdpSipSender {
    tx: mpsc::Sender<(SocketAddr, Bytes)>,
}

#[async_trait]
impl SipSender for UdpSipSender {
    async fn send(&self, target: SocketAddr, payload: Bytes) {
        if self.tx.send((target, payload)).await.is_err() {
            warn!("SIP writer gone; dropping outbound datagram");
        }
    }
}

/// Spawns the reader and writer tasks for the shared SIP socket.
///
/// `recovered_tx` fires after a successful re-bind plus settle; the
/// registration engine re-registers on it. Returns the sender handle.
pub fn spawn_sip_transport(
    socket: Arc<UdpSocket>,
    packet_tx: mpsc::Sender<InboundDatagram>,
    recovered_tx: mpsc::Sender<()>,
) -> UdpSipSender {
    let (out_tx, mut out_rx) = mpsc::channel::<(SocketAddr, Bytes)>(256);
    let (socket_tx, mut socket_rx) = watch::channel(Arc::clone(&socket));

    // Writer: drains the queue onto whichever socket is current.
    tokio::spawn(async move {
        while let Some((target, payload)) = out_rx.recv().await {
            let current = socket_rx.borrow_and_update().clone();
            if let Err(e) = current.send_to(&payload, target).await {
                warn!(error = %e, %target, "SIP send failed");
            }
        }
    });

    // Reader: receives datagrams, heals the socket on repeated errors.
    tokio::spawn(async move {
        let mut current = socket;
        let mut consecutive_errors: u32 = 0;
        let mut buf = [0u8; 65536];
        loop {
            match current.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    consecutive_errors = 0;
                    let datagram = InboundDatagram {
                        payload: Bytes::copy_from_slice(&buf[..len]),
                        peer,
                    };
                    if packet_tx.send(datagram).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(error = %e, consecutive_errors, "SIP receive error");
                    if consecutive_errors < MAX_SOCKET_ERRORS {
                        continue;
                    }
                    let local = current
                        .local_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "0.0.0.0:5060".to_string());
                    // Release every reference to the dead socket before
                    // re-binding its port.
                    let placeholder = match UdpSocket::bind("127.0.0.1:0").await {
                        Ok(socket) => Arc::new(socket),
                        Err(e) => {
                            error!(error = %e, "cannot bind placeholder socket");
                            return;
                        }
                    };
                    let _ = socket_tx.send(Arc::clone(&placeholder));
                    current = placeholder;
                    match UdpSocket::bind(&local).await {
                        Ok(fresh) => {
                            info!(%local, "SIP socket re-bound");
                            current = Arc::new(fresh);
                            let _ = socket_tx.send(Arc::clone(&current));
                            consecutive_errors = 0;
                            tokio::time::sleep(REBIND_SETTLE).await;
                            let _ = recovered_tx.send(()).await;
                        }
                        Err(e) => {
                            error!(error = %e, %local, "SIP socket re-bind failed");
                            // Unrecoverable: exit code 2 is handled by main
                            // noticing the reader is gone.
                            return;
                        }
                    }
                }
            }
        }
    });

    UdpSipSender { tx: out_tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_datagrams() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = socket.local_addr().unwrap();
        let (packet_tx, mut packet_rx) = mpsc::channel(8);
        let (recovered_tx, _recovered_rx) = mpsc::channel(1);
        let sender = spawn_sip_transport(socket, packet_tx, recovered_tx);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"OPTIONS sip:x SIP/2.0\r\n\r\n", local)
            .await
            .unwrap();

        let datagram = packet_rx.recv().await.unwrap();
        assert!(datagram.payload.starts_with(b"OPTIONS"));

        // And outbound through the write queue reaches the peer.
        sender
            .send(peer.local_addr().unwrap(), Bytes::from_static(b"\r\n\r\n"))
            .await;
        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"\r\n\r\n");
    }
}
