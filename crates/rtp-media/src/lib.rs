// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The bridge's media path: G.711 transforms, RTP packetization, and the
//! 20 ms paced sender that keeps the far-end jitter buffer happy.

mod codec;
mod pacer;
mod packet;
mod session;

pub use codec::{alaw_to_linear, linear_to_alaw, linear_to_ulaw, ulaw_to_linear, G711Codec};
pub use pacer::{spawn_pacer, PacerHandle, FRAME_BYTES, FRAME_INTERVAL};
pub use packet::{RtpError, RtpHeader, RtpPacket, PT_PCMA, PT_PCMU};
pub use session::{InboundFrame, MediaError, RtpSession};
