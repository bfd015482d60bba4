// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Typed accessors for the header values the bridge engine consumes.

use smol_str::SmolStr;

use crate::{method::Method, uri::SipUri};

/// Extracts the `tag=` parameter from a From/To header value.
pub fn tag_param(value: &str) -> Option<SmolStr> {
    let idx = value.find("tag=")?;
    // Require the parameter delimiter so "nontag=" style text never matches.
    if idx > 0 && !matches!(value.as_bytes()[idx - 1], b';' | b' ' | b'\t') {
        return None;
    }
    let rest = &value[idx + 4..];
    let end = rest
        .find(|c: char| c == ';' || c == ',' || c.is_whitespace())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(SmolStr::new(&rest[..end]))
}

/// Parsed CSeq header: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeqValue {
    pub seq: u32,
    pub method: Method,
}

/// Parses `CSeq: <number> <method>`.
pub fn parse_cseq(value: &str) -> Option<CSeqValue> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse().ok()?;
    let method = Method::from_token(parts.next()?);
    Some(CSeqValue { seq, method })
}

/// Digest challenge parameters from a WWW-Authenticate or
/// Proxy-Authenticate header (RFC 2617 §3.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: SmolStr,
    pub nonce: SmolStr,
    pub qop: Option<SmolStr>,
    pub algorithm: Option<SmolStr>,
    pub opaque: Option<SmolStr>,
}

impl DigestChallenge {
    /// True when the challenge offers `qop=auth` (quoted or bare).
    pub fn offers_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|t| t.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Parses a `Digest realm="...", nonce="...", qop="auth", ...` challenge.
/// Parameter values may be quoted or bare.
pub fn parse_digest_challenge(value: &str) -> Option<DigestChallenge> {
    let rest = value.trim();
    let rest = rest
        .strip_prefix("Digest")
        .or_else(|| rest.strip_prefix("digest"))?
        .trim_start();

    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    let mut algorithm = None;
    let mut opaque = None;

    for (name, param) in split_auth_params(rest) {
        match name.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(param),
            "nonce" => nonce = Some(param),
            "qop" => qop = Some(param),
            "algorithm" => algorithm = Some(param),
            "opaque" => opaque = Some(param),
            _ => {}
        }
    }

    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
        qop,
        algorithm,
        opaque,
    })
}

/// Splits comma-separated `name=value` auth parameters, honoring quoting.
fn split_auth_params(raw: &str) -> Vec<(SmolStr, SmolStr)> {
    let mut params = Vec::new();
    let mut depth_quoted = false;
    let mut start = 0;
    let bytes = raw.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => depth_quoted = !depth_quoted,
            b',' if !depth_quoted => {
                push_auth_param(&raw[start..i], &mut params);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_auth_param(&raw[start..], &mut params);
    params
}

fn push_auth_param(piece: &str, params: &mut Vec<(SmolStr, SmolStr)>) {
    if let Some((name, value)) = piece.split_once('=') {
        let value = value.trim().trim_matches('"');
        params.push((SmolStr::new(name.trim()), SmolStr::new(value)));
    }
}

/// RFC 5373 answer mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    Auto,
    Manual,
}

/// Parses an `Answer-Mode` / `Priv-Answer-Mode` header value.
/// The value may carry parameters (`Auto;require`).
pub fn parse_answer_mode(value: &str) -> Option<AnswerMode> {
    let mode = value.split(';').next()?.trim();
    if mode.eq_ignore_ascii_case("auto") {
        Some(AnswerMode::Auto)
    } else if mode.eq_ignore_ascii_case("manual") {
        Some(AnswerMode::Manual)
    } else {
        None
    }
}

/// Which party refreshes the session under RFC 4028.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Uac,
    Uas,
}

/// Parsed `Session-Expires` header (RFC 4028 §4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpires {
    pub seconds: u32,
    pub refresher: Option<Refresher>,
}

/// Parses `Session-Expires: 1800;refresher=uas`.
pub fn parse_session_expires(value: &str) -> Option<SessionExpires> {
    let mut parts = value.split(';');
    let seconds = parts.next()?.trim().parse().ok()?;
    let mut refresher = None;
    for param in parts {
        if let Some((name, val)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("refresher") {
                refresher = match val.trim().to_ascii_lowercase().as_str() {
                    "uac" => Some(Refresher::Uac),
                    "uas" => Some(Refresher::Uas),
                    _ => None,
                };
            }
        }
    }
    Some(SessionExpires { seconds, refresher })
}

/// Extracts the human-readable portion of a `Reason` header: the quoted
/// `text=` parameter when present, the whole value otherwise.
pub fn parse_reason(value: &str) -> SmolStr {
    for param in value.split(';') {
        if let Some((name, text)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("text") {
                return SmolStr::new(text.trim().trim_matches('"'));
            }
        }
    }
    SmolStr::new(value.trim())
}

/// Parses the URI out of a Contact/To/From header value, honoring angle
/// brackets.
pub fn parse_contact_uri(value: &str) -> Option<SipUri> {
    let trimmed = value.trim();
    let candidate = if let Some(start) = trimmed.find('<') {
        let end = trimmed[start + 1..].find('>')?;
        &trimmed[start + 1..start + 1 + end]
    } else {
        // Strip display name and parameters from a bare URI form.
        trimmed.split(';').next()?.trim()
    };
    SipUri::parse(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_tag() {
        let tag = tag_param("<sip:caller@pbx>;tag=1928301774").unwrap();
        assert_eq!(tag.as_str(), "1928301774");
    }

    #[test]
    fn tag_stops_at_delimiters() {
        assert_eq!(
            tag_param("<sip:a@b>;tag=abc;other=1").unwrap().as_str(),
            "abc"
        );
        assert!(tag_param("<sip:a@b>").is_none());
    }

    #[test]
    fn parses_cseq() {
        let cseq = parse_cseq("314159 INVITE").unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert!(parse_cseq("notanumber INVITE").is_none());
    }

    #[test]
    fn parses_quoted_challenge() {
        let challenge = parse_digest_challenge(
            "Digest realm=\"asterisk\", nonce=\"1a2b3c\", qop=\"auth\", algorithm=MD5, opaque=\"xyz\"",
        )
        .unwrap();
        assert_eq!(challenge.realm.as_str(), "asterisk");
        assert_eq!(challenge.nonce.as_str(), "1a2b3c");
        assert!(challenge.offers_auth_qop());
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
    }

    #[test]
    fn parses_unquoted_challenge() {
        let challenge =
            parse_digest_challenge("Digest realm=asterisk, nonce=1a2b3c, qop=auth").unwrap();
        assert_eq!(challenge.realm.as_str(), "asterisk");
        assert!(challenge.offers_auth_qop());
    }

    #[test]
    fn qop_list_inside_quotes_is_one_param() {
        let challenge =
            parse_digest_challenge("Digest realm=\"r\", nonce=\"n\", qop=\"auth,auth-int\"")
                .unwrap();
        assert!(challenge.offers_auth_qop());
        assert_eq!(challenge.qop.as_deref(), Some("auth,auth-int"));
    }

    #[test]
    fn challenge_without_nonce_is_rejected() {
        assert!(parse_digest_challenge("Digest realm=\"r\"").is_none());
    }

    #[test]
    fn parses_answer_mode() {
        assert_eq!(parse_answer_mode("Auto"), Some(AnswerMode::Auto));
        assert_eq!(parse_answer_mode("auto;require"), Some(AnswerMode::Auto));
        assert_eq!(parse_answer_mode("Manual"), Some(AnswerMode::Manual));
        assert_eq!(parse_answer_mode("bogus"), None);
    }

    #[test]
    fn parses_session_expires() {
        let se = parse_session_expires("1800;refresher=uas").unwrap();
        assert_eq!(se.seconds, 1800);
        assert_eq!(se.refresher, Some(Refresher::Uas));

        let bare = parse_session_expires("90").unwrap();
        assert_eq!(bare.seconds, 90);
        assert!(bare.refresher.is_none());
    }

    #[test]
    fn reason_prefers_text_param() {
        assert_eq!(
            parse_reason("Q.850;cause=16;text=\"Normal call clearing\"").as_str(),
            "Normal call clearing"
        );
        assert_eq!(parse_reason("User hangup").as_str(), "User hangup");
    }

    #[test]
    fn contact_uri_honors_angle_brackets() {
        let uri = parse_contact_uri("\"Bob\" <sip:bob@192.0.2.4:5062>;expires=60").unwrap();
        assert_eq!(uri.host.as_str(), "192.0.2.4");
        assert_eq!(uri.port, Some(5062));

        let bare = parse_contact_uri("sip:alice@192.0.2.5;transport=udp").unwrap();
        assert_eq!(bare.host.as_str(), "192.0.2.5");
    }
}
