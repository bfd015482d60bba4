// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri};

/// First line of a SIP request: `Method SP Request-URI SP SIP/2.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self { method, uri }
    }
}

/// First line of a SIP response: `SIP/2.0 SP code SP reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// True when the mandatory request headers of RFC 3261 §8.1.1 are all
    /// present. Messages failing this check are discarded by the engine.
    pub fn has_required_headers(&self) -> bool {
        ["Via", "From", "To", "Call-ID", "CSeq"]
            .iter()
            .all(|name| self.headers.get(name).is_some())
    }

    /// Call-ID header value, if present.
    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }
}

/// In-memory representation of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Builds a response echoing Via, From, To, Call-ID, and CSeq from the
    /// request per RFC 3261 §8.2.6.2. For success-class responses the To
    /// header is augmented with `local_tag` unless a tag is already present.
    pub fn for_request(request: &Request, code: u16, reason: &str, local_tag: Option<&str>) -> Self {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        if let Some(from) = request.headers.get("From") {
            headers.push("From", from.clone());
        }
        if let Some(to) = request.headers.get("To") {
            let to_value = match local_tag {
                Some(tag) if !to.contains(";tag=") => SmolStr::new(format!("{};tag={}", to, tag)),
                _ => to.clone(),
            };
            headers.push("To", to_value);
        }
        if let Some(call_id) = request.headers.get("Call-ID") {
            headers.push("Call-ID", call_id.clone());
        }
        if let Some(cseq) = request.headers.get("CSeq") {
            headers.push("CSeq", cseq.clone());
        }
        Self::new(StatusLine::new(code, SmolStr::new(reason)), headers, Bytes::new())
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.start.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code)
    }

    pub fn is_final(&self) -> bool {
        self.start.code >= 200
    }

    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }
}

/// Either a SIP request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => &req.headers,
            Self::Response(res) => &res.headers,
        }
    }
}
