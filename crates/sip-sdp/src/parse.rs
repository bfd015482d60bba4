use smol_str::SmolStr;

use crate::{Direction, MediaDescription, Origin, RtpMap, SessionDescription};

/// Errors produced while parsing a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    MissingVersion,
    MalformedLine(String),
}

impl std::fmt::Display for SdpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingVersion => write!(f, "session description does not start with v=0"),
            Self::MalformedLine(line) => write!(f, "malformed SDP line: {}", line),
        }
    }
}

impl std::error::Error for SdpError {}

/// Parses a session description, tolerating unknown lines.
///
/// Unknown `a=` attributes and line types the bridge does not care about are
/// skipped; structurally broken `c=`/`m=` lines are errors because the media
/// path cannot be set up without them.
pub fn parse_sdp(raw: &str) -> Result<SessionDescription, SdpError> {
    let mut lines = raw.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some("v=0") => {}
        _ => return Err(SdpError::MissingVersion),
    }

    let mut session = SessionDescription::default();
    let mut current_media: Option<MediaDescription> = None;

    for line in lines {
        let Some((kind, value)) = line.split_once('=') else {
            return Err(SdpError::MalformedLine(line.to_string()));
        };
        match kind {
            "o" => session.origin = parse_origin(value),
            "c" => {
                let addr = parse_connection(value)
                    .ok_or_else(|| SdpError::MalformedLine(line.to_string()))?;
                match current_media.as_mut() {
                    Some(media) => media.connection = Some(addr),
                    None => session.connection = Some(addr),
                }
            }
            "m" => {
                if let Some(media) = current_media.take() {
                    session.media.push(media);
                }
                current_media = Some(
                    parse_media(value).ok_or_else(|| SdpError::MalformedLine(line.to_string()))?,
                );
            }
            "a" => apply_attribute(value, &mut session, current_media.as_mut()),
            // s=, t=, b=, k=, i=, u=, e=, p=, z=, r= carry nothing the
            // audio bridge uses.
            _ => {}
        }
    }

    if let Some(media) = current_media.take() {
        session.media.push(media);
    }
    Ok(session)
}

fn parse_origin(value: &str) -> Option<Origin> {
    let mut parts = value.split_whitespace();
    let username = parts.next()?;
    let session_id = parts.next()?;
    let session_version = parts.next()?;
    let _net_type = parts.next()?;
    let _addr_type = parts.next()?;
    let unicast_address = parts.next()?;
    Some(Origin {
        username: SmolStr::new(username),
        session_id: SmolStr::new(session_id),
        session_version: SmolStr::new(session_version),
        unicast_address: SmolStr::new(unicast_address),
    })
}

/// `c=IN IP4 <host>`; IP6 connections are rejected (narrowband trunk is v4).
fn parse_connection(value: &str) -> Option<SmolStr> {
    let mut parts = value.split_whitespace();
    if parts.next()? != "IN" {
        return None;
    }
    if parts.next()? != "IP4" {
        return None;
    }
    // Strip any TTL/multicast suffix.
    let addr = parts.next()?.split('/').next()?;
    Some(SmolStr::new(addr))
}

/// `m=<type> <port> <proto> <fmt>…`
fn parse_media(value: &str) -> Option<MediaDescription> {
    let mut parts = value.split_whitespace();
    let media_type = parts.next()?;
    let port = parts.next()?.split('/').next()?.parse().ok()?;
    let protocol = parts.next()?;
    let formats = parts.filter_map(|f| f.parse::<u8>().ok()).collect();
    Some(MediaDescription {
        media_type: SmolStr::new(media_type),
        port,
        protocol: SmolStr::new(protocol),
        formats,
        connection: None,
        rtpmaps: Vec::new(),
        fmtp: Vec::new(),
        direction: None,
    })
}

fn apply_attribute(
    value: &str,
    session: &mut SessionDescription,
    media: Option<&mut MediaDescription>,
) {
    match value {
        "sendrecv" | "sendonly" | "recvonly" | "inactive" => {
            let direction = match value {
                "sendonly" => Direction::SendOnly,
                "recvonly" => Direction::RecvOnly,
                "inactive" => Direction::Inactive,
                _ => Direction::SendRecv,
            };
            match media {
                Some(m) => m.direction = Some(direction),
                None => session.direction = Some(direction),
            }
            return;
        }
        _ => {}
    }

    let Some(media) = media else { return };
    if let Some(map) = value.strip_prefix("rtpmap:") {
        if let Some(rtpmap) = parse_rtpmap(map) {
            media.rtpmaps.push(rtpmap);
        }
    } else if let Some(fmtp) = value.strip_prefix("fmtp:") {
        if let Some((pt, params)) = fmtp.split_once(' ') {
            if let Ok(pt) = pt.parse::<u8>() {
                media.fmtp.push((pt, SmolStr::new(params.trim())));
            }
        }
    }
}

/// `<pt> <codec>/<rate>[/<params>]`
fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    let (pt, encoding) = value.split_once(' ')?;
    let payload_type = pt.trim().parse().ok()?;
    let mut pieces = encoding.trim().split('/');
    let encoding_name = pieces.next()?;
    let clock_rate = pieces.next()?.parse().ok()?;
    Some(RtpMap {
        payload_type,
        encoding_name: SmolStr::new(encoding_name),
        clock_rate,
    })
}
