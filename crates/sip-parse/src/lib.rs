// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message parser and serializer.
//!
//! Parses requests and responses from raw UDP datagrams and serializes them
//! back with normalized `Content-Length` accounting. Parsing is tolerant the
//! way a long-lived trunk client has to be: a Content-Length that disagrees
//! with the received octet count is reported through [`ParseOutcome`] but the
//! message is still delivered when the header section is complete.
//!
//! # Example
//! ```
//! use sip_parse::{parse_request, serialize_request};
//! use bytes::Bytes;
//! # let raw = b"OPTIONS sip:30@192.0.2.10 SIP/2.0\r\nVia: SIP/2.0/UDP pbx.example.com;branch=z9hG4bK776asdhds\r\nTo: <sip:30@192.0.2.10>\r\nFrom: <sip:pbx@pbx.example.com>;tag=778\r\nCall-ID: a84b4c76e66710@pbx.example.com\r\nCSeq: 63104 OPTIONS\r\nContent-Length: 0\r\n\r\n";
//! let outcome = parse_request(&Bytes::from_static(raw)).unwrap();
//! let bytes = serialize_request(&outcome.message);
//! ```

use bytes::{Bytes, BytesMut};
use sip_core::{is_valid_branch, Headers, Method, Request, RequestLine, Response, SipUri, StatusLine};
use smol_str::SmolStr;
use tracing::debug;

/// Datagrams larger than this are dropped outright.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A parsed message plus framing diagnostics.
#[derive(Debug, Clone)]
pub struct ParseOutcome<T> {
    pub message: T,
    /// Set when the declared Content-Length disagreed with the octets on the
    /// wire and the body was delivered in degraded mode.
    pub length_mismatch: bool,
}

/// Parses a SIP request from raw network bytes.
pub fn parse_request(datagram: &Bytes) -> Option<ParseOutcome<Request>> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let (method, uri) = parse_request_line(first)?;
    let headers = parse_headers(lines)?;
    if let Some(via) = headers.get("Via") {
        if let Some(branch) = via
            .split(';')
            .find_map(|p| p.trim().strip_prefix("branch="))
        {
            if !is_valid_branch(branch.trim()) {
                return None;
            }
        }
    }
    if !cseq_matches(&headers, &method) {
        return None;
    }
    let (body, length_mismatch) = extract_body(body_bytes, &headers);

    Some(ParseOutcome {
        message: Request::new(RequestLine::new(method, uri), headers, body),
        length_mismatch,
    })
}

/// Parses a SIP response from raw network bytes.
pub fn parse_response(datagram: &Bytes) -> Option<ParseOutcome<Response>> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let status = parse_status_line(first)?;
    let headers = parse_headers(lines)?;
    let (body, length_mismatch) = extract_body(body_bytes, &headers);

    Some(ParseOutcome {
        message: Response::new(status, headers, body),
        length_mismatch,
    })
}

/// Serializes a SIP request, normalizing `Content-Length` and inserting
/// `Max-Forwards: 70` when absent.
pub fn serialize_request(req: &Request) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(
        buf,
        "{} {} SIP/2.0\r\n",
        req.start.method.as_str(),
        req.start.uri.as_str()
    );

    let mut has_max_forwards = false;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length")
            || header.name.eq_ignore_ascii_case("l")
        {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }

    if !has_max_forwards {
        buf.push_str("Max-Forwards: 70\r\n");
    }
    let _ = write!(buf, "Content-Length: {}\r\n", req.body.len());
    buf.push_str("\r\n");

    let mut out = BytesMut::with_capacity(buf.len() + req.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(req.body.as_ref());
    out.freeze()
}

/// Serializes a SIP response, normalizing `Content-Length`.
pub fn serialize_response(res: &Response) -> Bytes {
    use std::fmt::Write;
    let mut buf = String::new();

    let _ = write!(buf, "SIP/2.0 {} {}\r\n", res.start.code, res.start.reason);
    for header in res.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length")
            || header.name.eq_ignore_ascii_case("l")
        {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }
    let _ = write!(buf, "Content-Length: {}\r\n", res.body.len());
    buf.push_str("\r\n");

    let mut out = BytesMut::with_capacity(buf.len() + res.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(res.body.as_ref());
    out.freeze()
}

/// Parses the request-line into a method and request URI.
fn parse_request_line(line: &str) -> Option<(Method, SipUri)> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line.trim()).ok()?;

    if !version_token.eq_ignore_ascii_case("SIP/2.0") {
        return None;
    }
    let method = Method::from_token(method_token);
    let uri = SipUri::parse(uri_token)?;
    Some((method, uri))
}

/// Parses the status-line of a SIP response.
fn parse_status_line(line: &str) -> Option<StatusLine> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line.trim()).ok()?;
    if !(100..=699).contains(&code) {
        return None;
    }
    Some(StatusLine::new(code, SmolStr::new(reason.trim())))
}

/// Splits raw bytes into header text and body slice at `\r\n\r\n`.
fn split_head_body(datagram: &Bytes) -> Option<(&str, &[u8])> {
    let data = datagram.as_ref();
    let delim = b"\r\n\r\n";

    if let Some(pos) = data.windows(delim.len()).position(|window| window == delim) {
        let head = std::str::from_utf8(&data[..pos]).ok()?;
        let body = &data[pos + delim.len()..];
        Some((head, body))
    } else {
        let head = std::str::from_utf8(data).ok()?;
        Some((head, &[]))
    }
}

/// Parses SIP headers, rejecting folded continuation lines per RFC 3261 §7.3.1.
fn parse_headers<'a, I>(lines: I) -> Option<Headers>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers = Headers::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return None;
        }
        let (name, value) = line.split_once(':')?;
        headers.push(canonical_header_name(name.trim()), value.trim());
    }

    Some(headers)
}

/// Expands RFC 3261 compact header forms to their canonical names.
fn canonical_header_name(name: &str) -> SmolStr {
    let canonical = match name.to_ascii_lowercase().as_str() {
        "i" => "Call-ID",
        "f" => "From",
        "t" => "To",
        "m" => "Contact",
        "l" => "Content-Length",
        "k" => "Supported",
        "c" => "Content-Type",
        "v" => "Via",
        _ => name,
    };
    SmolStr::new(canonical)
}

/// Returns the body according to the declared Content-Length.
///
/// Degraded mode: a declared length longer than what arrived delivers the
/// whole received body; shorter truncates to the declaration. Either way the
/// mismatch is flagged so the engine can count it.
fn extract_body(body_bytes: &[u8], headers: &Headers) -> (Bytes, bool) {
    let declared = headers
        .get("Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok());

    match declared {
        None => (Bytes::copy_from_slice(body_bytes), false),
        Some(declared) if declared == body_bytes.len() => {
            (Bytes::copy_from_slice(body_bytes), false)
        }
        Some(declared) if declared < body_bytes.len() => {
            debug!(
                declared,
                received = body_bytes.len(),
                "content-length shorter than body; truncating"
            );
            (Bytes::copy_from_slice(&body_bytes[..declared]), true)
        }
        Some(declared) => {
            debug!(
                declared,
                received = body_bytes.len(),
                "content-length longer than body; delivering what arrived"
            );
            (Bytes::copy_from_slice(body_bytes), true)
        }
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '.'
                | '^'
                | '_'
                | '`'
                | '|'
                | '~'
        )
}

// Permissive URI character set: stop at whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}

/// CSeq method, when present, must match the request-line method.
fn cseq_matches(headers: &Headers, method: &Method) -> bool {
    match headers.get("CSeq") {
        None => true,
        Some(cseq) => {
            let mut parts = cseq.split_whitespace();
            let _number = parts.next();
            let m = parts.next().unwrap_or("");
            method.as_str().eq_ignore_ascii_case(m)
        }
    }
}
