//! 20 ms send pacing.
//!
//! Audio handed to the bridge arrives in bursts (the AI emits multi-frame
//! deltas), but the far end expects one 160-byte G.711 payload every 20 ms.
//! The pacer buffers whole bursts and releases frames on the cadence,
//! discarding material once it has fallen more than two frame times behind
//! schedule: late audio is worse than lost audio on a phone call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// One G.711 frame: 20 ms at 8 kHz.
pub const FRAME_BYTES: usize = 160;
/// Cadence between frames.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Frames older than this relative to their slot are dropped.
const MAX_LAG: Duration = Duration::from_millis(40);
/// Upper bound on buffered frames (~10 s of audio) to bound memory.
const MAX_QUEUED_FRAMES: usize = 512;

/// Handle for feeding audio into a session's pacer.
#[derive(Clone)]
pub struct PacerHandle {
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

impl PacerHandle {
    /// Queues an encoded audio burst for paced transmission. The burst is
    /// chunked into frames inside the pacer task; partial trailing bytes are
    /// held until the next burst completes the frame.
    pub fn enqueue(&self, payload: Bytes) {
        if self.tx.try_send(payload).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("pacer inbox full; dropping audio burst");
        }
    }

    /// Number of bursts/frames discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawns the pacing task. Paced frames are emitted on the returned channel
/// in order; the caller forwards them to the RTP socket.
pub fn spawn_pacer() -> (PacerHandle, mpsc::Receiver<Bytes>) {
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(64);
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(4);
    let dropped = Arc::new(AtomicU64::new(0));

    tokio::spawn(run_pacer(in_rx, out_tx, Arc::clone(&dropped)));

    (
        PacerHandle {
            tx: in_tx,
            dropped,
        },
        out_rx,
    )
}

async fn run_pacer(
    mut rx: mpsc::Receiver<Bytes>,
    out: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
) {
    let mut queue: VecDeque<Bytes> = VecDeque::new();
    let mut remainder = BytesMut::new();
    let mut deadline = Instant::now();
    let mut armed = false;

    loop {
        if !armed {
            // Nothing scheduled: block until more audio arrives.
            match rx.recv().await {
                Some(burst) => {
                    chunk_frames(burst, &mut remainder, &mut queue, &dropped);
                    if !queue.is_empty() {
                        deadline = Instant::now();
                        armed = true;
                    }
                }
                None => break,
            }
            continue;
        }

        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(burst) => chunk_frames(burst, &mut remainder, &mut queue, &dropped),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                if let Some(frame) = queue.pop_front() {
                    if now.saturating_duration_since(deadline) > MAX_LAG {
                        // Fell behind; this frame's moment has passed.
                        dropped.fetch_add(1, Ordering::Relaxed);
                    } else if out.try_send(frame).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                deadline += FRAME_INTERVAL;
                if queue.is_empty() {
                    armed = false;
                }
            }
        }
    }
}

/// Splits a burst into whole frames, carrying partial bytes forward.
fn chunk_frames(
    burst: Bytes,
    remainder: &mut BytesMut,
    queue: &mut VecDeque<Bytes>,
    dropped: &AtomicU64,
) {
    remainder.extend_from_slice(&burst);
    while remainder.len() >= FRAME_BYTES {
        let frame = remainder.split_to(FRAME_BYTES).freeze();
        if queue.len() >= MAX_QUEUED_FRAMES {
            queue.pop_front();
            dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(frame);
    }
}
