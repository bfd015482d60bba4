//! Typed event channels for external observers.
//!
//! One channel per event kind rather than a stringly-typed bus: consumers
//! subscribe to exactly what they care about and the compiler knows the
//! payload shapes.

use smol_str::SmolStr;
use tokio::sync::mpsc;

/// A new inbound call was accepted.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: SmolStr,
    pub from: SmolStr,
}

/// A call ended and its session was removed.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: SmolStr,
    pub reason: SmolStr,
}

/// Senders handed to the engine; receivers are for whoever observes.
#[derive(Clone)]
pub struct EventSenders {
    pub incoming_call: mpsc::Sender<IncomingCall>,
    pub call_ended: mpsc::Sender<CallEnded>,
}

pub struct EventReceivers {
    pub incoming_call: mpsc::Receiver<IncomingCall>,
    pub call_ended: mpsc::Receiver<CallEnded>,
}

/// Creates the event channel pairs.
pub fn channels() -> (EventSenders, EventReceivers) {
    let (incoming_tx, incoming_rx) = mpsc::channel(32);
    let (ended_tx, ended_rx) = mpsc::channel(32);
    (
        EventSenders {
            incoming_call: incoming_tx,
            call_ended: ended_tx,
        },
        EventReceivers {
            incoming_call: incoming_rx,
            call_ended: ended_rx,
        },
    )
}
