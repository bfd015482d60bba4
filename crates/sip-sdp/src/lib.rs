// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SDP parsing and RFC 3264 offer/answer for the narrowband audio profile.
//!
//! The bridge only ever negotiates one audio stream carrying G.711, so this
//! crate parses the handful of lines that matter (`o=`, `c=`, `m=audio`,
//! `a=rtpmap`, `a=fmtp`, stream direction) and answers with the fixed
//! PCMU/PCMA template.

mod negotiate;
mod parse;

pub use negotiate::{negotiate_audio, NegotiateError, NegotiatedAudio};
pub use parse::{parse_sdp, SdpError};

use smol_str::SmolStr;

/// Static payload types the bridge speaks (RFC 3551 Table 4).
pub const PT_PCMU: u8 = 0;
pub const PT_PCMA: u8 = 8;

/// Session origin line (`o=`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: SmolStr,
    pub session_id: SmolStr,
    pub session_version: SmolStr,
    pub unicast_address: SmolStr,
}

/// Stream direction attribute, defaulting to sendrecv per RFC 4566 §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// An `a=rtpmap:<pt> <codec>/<rate>` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding_name: SmolStr,
    pub clock_rate: u32,
}

/// A parsed `m=` section together with its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media_type: SmolStr,
    pub port: u16,
    pub protocol: SmolStr,
    pub formats: Vec<u8>,
    /// Media-level `c=` override, when present.
    pub connection: Option<SmolStr>,
    pub rtpmaps: Vec<RtpMap>,
    pub fmtp: Vec<(u8, SmolStr)>,
    pub direction: Option<Direction>,
}

impl MediaDescription {
    /// Looks up the rtpmap for a payload type, if the offer declared one.
    pub fn rtpmap(&self, payload_type: u8) -> Option<&RtpMap> {
        self.rtpmaps.iter().find(|m| m.payload_type == payload_type)
    }
}

/// A parsed session description reduced to the audio-profile essentials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    pub origin: Option<Origin>,
    /// Session-level `c=IN IP4 <host>` address.
    pub connection: Option<SmolStr>,
    pub direction: Option<Direction>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// First `m=audio` section, if any.
    pub fn audio(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Connection address for the audio stream: media-level `c=` wins over
    /// session-level.
    pub fn audio_connection(&self) -> Option<&SmolStr> {
        self.audio()
            .and_then(|m| m.connection.as_ref())
            .or(self.connection.as_ref())
    }
}

/// Renders the bridge's audio answer (RFC 3264 minimum template).
pub fn build_audio_answer(
    local_ip: &str,
    rtp_port: u16,
    payload_type: u8,
    encoding_name: &str,
    session_id: u32,
    session_version: u32,
) -> String {
    format!(
        "v=0\r\n\
         o=parley {} {} IN IP4 {}\r\n\
         s=-\r\n\
         c=IN IP4 {}\r\n\
         t=0 0\r\n\
         m=audio {} RTP/AVP {}\r\n\
         a=rtpmap:{} {}/8000\r\n\
         a=sendrecv\r\n",
        session_id, session_version, local_ip, local_ip, rtp_port, payload_type, payload_type,
        encoding_name
    )
}
