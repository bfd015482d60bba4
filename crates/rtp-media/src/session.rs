//! Per-call RTP socket management.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::packet::{RtpHeader, RtpPacket};

/// Errors from the media path.
#[derive(Debug)]
pub enum MediaError {
    NoPortAvailable { start: u16, end: u16 },
    NoRemoteAddress,
    Io(std::io::Error),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPortAvailable { start, end } => {
                write!(f, "no RTP port available in {}..{}", start, end)
            }
            Self::NoRemoteAddress => write!(f, "remote RTP address not set"),
            Self::Io(e) => write!(f, "RTP socket error: {}", e),
        }
    }
}

impl std::error::Error for MediaError {}

impl From<std::io::Error> for MediaError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// An inbound audio frame: raw G.711 payload plus RTP metadata.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub payload: Bytes,
    pub sequence: u16,
    pub timestamp: u32,
    pub payload_type: u8,
}

/// One call's RTP socket with outbound sequencing state.
///
/// Sequence and timestamp start at random values and advance by 1 and by the
/// frame length per packet; the SSRC is fixed for the session's lifetime.
pub struct RtpSession {
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
    ssrc: u32,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    first_packet: bool,
    malformed: Arc<AtomicU64>,
}

impl RtpSession {
    /// Binds a session socket deterministically within the configured port
    /// range, stepping even ports (the RTCP convention keeps odd ports free).
    pub async fn bind(range: (u16, u16), payload_type: u8) -> Result<Self, MediaError> {
        let (start, end) = range;
        let mut port = if start % 2 == 0 { start } else { start + 1 };
        while port < end {
            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => {
                    debug!(port, "RTP socket bound");
                    return Ok(Self {
                        socket: Arc::new(socket),
                        remote: None,
                        ssrc: rand::random::<u32>(),
                        payload_type,
                        sequence: rand::random::<u16>(),
                        timestamp: rand::random::<u32>(),
                        first_packet: true,
                        malformed: Arc::new(AtomicU64::new(0)),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    port = port.saturating_add(2);
                }
                Err(e) => return Err(MediaError::Io(e)),
            }
        }
        Err(MediaError::NoPortAvailable { start, end })
    }

    /// Local port the session bound.
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sets the far-end address parsed from the offered SDP.
    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote = Some(addr);
    }

    /// Count of malformed inbound datagrams dropped so far.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Sends one already-encoded G.711 frame. Sequence increments by one and
    /// the timestamp by the payload length (160 per 20 ms frame at 8 kHz).
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), MediaError> {
        let remote = self.remote.ok_or(MediaError::NoRemoteAddress)?;

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        let timestamp = self.timestamp;
        self.timestamp = self.timestamp.wrapping_add(payload.len() as u32);
        // Marker set on the first packet of the stream only.
        let marker = std::mem::take(&mut self.first_packet);

        let header = RtpHeader::outbound(self.payload_type, marker, sequence, timestamp, self.ssrc);
        let packet = RtpPacket::new(header, Bytes::copy_from_slice(payload));
        self.socket.send_to(&packet.to_bytes(), remote).await?;
        Ok(())
    }

    /// Spawns the receive loop, delivering parsed frames on the returned
    /// channel. Malformed datagrams are counted and dropped without
    /// notification upstream.
    pub fn spawn_receiver(&self) -> mpsc::Receiver<InboundFrame> {
        let (tx, rx) = mpsc::channel(32);
        let socket = Arc::clone(&self.socket);
        let malformed = Arc::clone(&self.malformed);

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, _peer)) => match RtpPacket::from_bytes(&buf[..len]) {
                        Ok(packet) => {
                            let frame = InboundFrame {
                                payload: packet.payload,
                                sequence: packet.header.sequence,
                                timestamp: packet.header.timestamp,
                                payload_type: packet.header.payload_type,
                            };
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            malformed.fetch_add(1, Ordering::Relaxed);
                            debug!(error = %e, "dropping malformed RTP datagram");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "RTP receive loop ending");
                        break;
                    }
                }
            }
        });
        rx
    }
}
