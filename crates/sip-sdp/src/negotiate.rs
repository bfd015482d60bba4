use smol_str::SmolStr;

use crate::{Direction, SessionDescription, PT_PCMA, PT_PCMU};

/// Outcome of audio negotiation against an inbound offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAudio {
    pub payload_type: u8,
    pub encoding_name: SmolStr,
    /// Far-end RTP address from the offer's connection line.
    pub remote_host: SmolStr,
    pub remote_port: u16,
    pub direction: Direction,
}

/// Why an offer could not be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateError {
    /// The offer carries no `m=audio` section.
    NoAudio,
    /// No payload type in the offer maps onto G.711.
    NoCommonCodec,
    /// The offer has audio but no usable connection address.
    NoConnectionAddress,
}

impl std::fmt::Display for NegotiateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAudio => write!(f, "offer has no audio stream"),
            Self::NoCommonCodec => write!(f, "no mutually supported audio codec"),
            Self::NoConnectionAddress => write!(f, "offer has no connection address"),
        }
    }
}

impl std::error::Error for NegotiateError {}

/// Picks the first mutually supported payload type from the offer.
///
/// Per RFC 3264 the answer echoes the offerer's preference order, so the
/// first PCMU/PCMA entry in the `m=` format list wins. An offer whose format
/// list names neither but whose rtpmaps advertise G.711 under a dynamic
/// payload type still negotiates μ-law under its offered number.
pub fn negotiate_audio(offer: &SessionDescription) -> Result<NegotiatedAudio, NegotiateError> {
    let audio = offer.audio().ok_or(NegotiateError::NoAudio)?;
    let remote_host = offer
        .audio_connection()
        .cloned()
        .ok_or(NegotiateError::NoConnectionAddress)?;

    let matched = audio.formats.iter().find_map(|&pt| match pt {
        PT_PCMU => Some((PT_PCMU, SmolStr::new("PCMU"))),
        PT_PCMA => Some((PT_PCMA, SmolStr::new("PCMA"))),
        other => audio.rtpmap(other).and_then(|map| {
            if map.encoding_name.eq_ignore_ascii_case("PCMU") {
                Some((other, SmolStr::new("PCMU")))
            } else if map.encoding_name.eq_ignore_ascii_case("PCMA") {
                Some((other, SmolStr::new("PCMA")))
            } else {
                None
            }
        }),
    });

    // Fall back to μ-law when the offer names payload types it never maps
    // (the far end may well speak G.711 anyway). Refuse only when every
    // offered format is provably something else.
    let chosen = match matched {
        Some(chosen) => chosen,
        None => {
            let all_proven_foreign = !audio.formats.is_empty()
                && audio.formats.iter().all(|&pt| audio.rtpmap(pt).is_some());
            if all_proven_foreign || audio.formats.is_empty() {
                return Err(NegotiateError::NoCommonCodec);
            }
            (PT_PCMU, SmolStr::new("PCMU"))
        }
    };

    Ok(NegotiatedAudio {
        payload_type: chosen.0,
        encoding_name: chosen.1,
        remote_host,
        remote_port: audio.port,
        direction: audio
            .direction
            .or(offer.direction)
            .unwrap_or(Direction::SendRecv),
    })
}
