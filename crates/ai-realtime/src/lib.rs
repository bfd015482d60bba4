// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! WebSocket client for the realtime conversational AI.
//!
//! One long-lived connection per process. The session is *unconfigured*
//! until the provider acknowledges our `session.update`; outbound audio
//! queues while unconfigured and flushes in FIFO order on acknowledgment.
//! The connection self-heals with exponential backoff, and the pending
//! audio queue survives reconnects because it belongs to the call, not to
//! the socket.

mod client;
mod events;
mod gate;

pub use client::{spawn_client, ClientCommand, RealtimeConfig, RealtimeHandle};
pub use events::{
    ClientEvent, ContentPart, ConversationItem, ErrorInfo, ServerEvent, SessionConfig,
    SessionMeta, ToolDefinition, TurnDetection,
};
pub use gate::{EgressQueue, SessionGate};
