//! Session-configuration gating for outbound audio.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::ClientEvent;

/// Bounded FIFO of base64 audio frames awaiting the configured-session flag.
/// Oldest frames are dropped on overflow: the most recent caller audio is
/// the audio worth delivering late.
#[derive(Debug)]
pub struct EgressQueue {
    frames: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl EgressQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, frame: String) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
        }
        self.frames.push_back(frame);
    }

    /// Removes and returns every queued frame in FIFO order.
    pub fn drain(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Gates audio egress on the provider having acknowledged `session.update`.
///
/// While unconfigured, frames land in the queue; `mark_configured` flushes
/// them in order ahead of anything sent afterwards. A reconnect clears the
/// configured flag but keeps the queue: the audio belongs to the call, not
/// to the connection that happened to be up when it was captured.
pub struct SessionGate {
    configured: bool,
    queue: EgressQueue,
    out: mpsc::Sender<ClientEvent>,
}

impl SessionGate {
    /// Default queue capacity in frames.
    pub const DEFAULT_CAPACITY: usize = 50;

    pub fn new(out: mpsc::Sender<ClientEvent>) -> Self {
        Self::with_capacity(out, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(out: mpsc::Sender<ClientEvent>, capacity: usize) -> Self {
        Self {
            configured: false,
            queue: EgressQueue::new(capacity),
            out,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Sends one base64 audio frame, or queues it while unconfigured.
    pub async fn send_audio(&mut self, audio: String) {
        if self.configured {
            self.forward(audio).await;
        } else {
            self.queue.push(audio);
        }
    }

    /// Marks the session configured and flushes the queue in FIFO order.
    pub async fn mark_configured(&mut self) {
        self.configured = true;
        let pending = self.queue.drain();
        if !pending.is_empty() {
            debug!(frames = pending.len(), "flushing queued audio");
        }
        for frame in pending {
            self.forward(frame).await;
        }
    }

    /// Called when the socket drops: the next connection must re-configure
    /// before audio flows again. Queued frames are preserved.
    pub fn mark_unconfigured(&mut self) {
        self.configured = false;
    }

    /// Drops any queued audio (call teardown).
    pub fn clear(&mut self) {
        let _ = self.queue.drain();
    }

    async fn forward(&self, audio: String) {
        if self
            .out
            .send(ClientEvent::InputAudioBufferAppend { audio })
            .await
            .is_err()
        {
            warn!("writer gone; dropping audio frame");
        }
    }
}
