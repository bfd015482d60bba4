// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Routes inbound SIP datagrams.
//!
//! Responses go to the registration engine; dialog requests fan out to
//! their session by Call-ID; OPTIONS and NOTIFY are answered in place;
//! anything unroutable gets the RFC-prescribed 405/481. Malformed messages
//! are counted and dropped silently.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sip_core::{Method, Request, Response};
use sip_parse::{parse_request, parse_response, serialize_response};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{EventSenders, IncomingCall};
use crate::registration::RegEvent;
use crate::session::{AiLink, CallSession, SessionEvent, SessionSettings};
use crate::transport::{InboundDatagram, SipSender};

const ALLOW_METHODS: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER, NOTIFY";

pub struct Dispatcher {
    config: Arc<Config>,
    settings: SessionSettings,
    sender: Arc<dyn SipSender>,
    ai: Arc<dyn AiLink>,
    reg_tx: Option<mpsc::Sender<RegEvent>>,
    sessions: Arc<DashMap<SmolStr, mpsc::Sender<SessionEvent>>>,
    events: EventSenders,
    removed_tx: mpsc::Sender<SmolStr>,
    malformed: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        sender: Arc<dyn SipSender>,
        ai: Arc<dyn AiLink>,
        reg_tx: Option<mpsc::Sender<RegEvent>>,
        sessions: Arc<DashMap<SmolStr, mpsc::Sender<SessionEvent>>>,
        events: EventSenders,
    ) -> (Self, mpsc::Receiver<SmolStr>) {
        let settings = SessionSettings::from_config(&config);
        let (removed_tx, removed_rx) = mpsc::channel(32);
        (
            Self {
                config,
                settings,
                sender,
                ai,
                reg_tx,
                sessions,
                events,
                removed_tx,
                malformed: AtomicU64::new(0),
            },
            removed_rx,
        )
    }

    /// Number of dropped malformed messages so far.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Drains inbound datagrams until the transport closes.
    pub async fn run(
        self,
        mut packets: mpsc::Receiver<InboundDatagram>,
        mut removed: mpsc::Receiver<SmolStr>,
    ) {
        loop {
            tokio::select! {
                datagram = packets.recv() => match datagram {
                    Some(datagram) => self.handle_datagram(datagram).await,
                    None => break,
                },
                gone = removed.recv() => {
                    if let Some(call_id) = gone {
                        self.sessions.remove(&call_id);
                        debug!(%call_id, active = self.sessions.len(), "session removed");
                    }
                }
            }
        }
    }

    pub async fn handle_datagram(&self, datagram: InboundDatagram) {
        let InboundDatagram { payload, peer } = datagram;

        // Keep-alive echoes and empty datagrams carry nothing to parse.
        if payload.iter().all(|&b| b == b'\r' || b == b'\n') {
            return;
        }

        if payload.starts_with(b"SIP/2.0") {
            match parse_response(&payload) {
                Some(outcome) => {
                    if outcome.length_mismatch {
                        self.malformed.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Some(reg_tx) = &self.reg_tx {
                        let _ = reg_tx.send(RegEvent::Response(outcome.message)).await;
                    } else {
                        debug!(peer = %peer, "response dropped (registration disabled)");
                    }
                }
                None => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                }
            }
            return;
        }

        let request = match parse_request(&payload) {
            Some(outcome) => {
                if outcome.length_mismatch {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                }
                outcome.message
            }
            None => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer, "unparsable datagram dropped");
                return;
            }
        };

        // RFC 3261 §8.1.1 mandatory headers; silently discard without them.
        if !request.has_required_headers() {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %peer, "request missing mandatory headers");
            return;
        }

        match &request.start.method {
            Method::Options | Method::Notify => {
                let mut response = Response::for_request(&request, 200, "OK", None);
                response.headers.push("Allow", ALLOW_METHODS);
                response.headers.push("Accept", "application/sdp");
                self.sender.send(peer, serialize_response(&response)).await;
            }
            Method::Unknown(token) => {
                debug!(method = %token, peer = %peer, "unknown method: 405");
                let mut response =
                    Response::for_request(&request, 405, "Method Not Allowed", None);
                response.headers.push("Allow", ALLOW_METHODS);
                self.sender.send(peer, serialize_response(&response)).await;
            }
            Method::Register => {
                // We are a client, not a registrar.
                let response = Response::for_request(&request, 405, "Method Not Allowed", None);
                self.sender.send(peer, serialize_response(&response)).await;
            }
            Method::Invite => self.route_invite(request, peer).await,
            Method::Ack => {
                if let Some(tx) = self.session_for(&request) {
                    let _ = tx.send(SessionEvent::Sip { request, peer }).await;
                }
                // Stray ACKs are dropped per RFC: no response to an ACK.
            }
            Method::Bye | Method::Cancel | Method::Update => {
                match self.session_for(&request) {
                    Some(tx) => {
                        let _ = tx.send(SessionEvent::Sip { request, peer }).await;
                    }
                    None => {
                        let response = Response::for_request(
                            &request,
                            481,
                            "Call/Transaction Does Not Exist",
                            None,
                        );
                        self.sender.send(peer, serialize_response(&response)).await;
                    }
                }
            }
        }
    }

    fn session_for(&self, request: &Request) -> Option<mpsc::Sender<SessionEvent>> {
        let call_id = request.call_id()?;
        self.sessions.get(call_id).map(|entry| entry.value().clone())
    }

    async fn route_invite(&self, request: Request, peer: SocketAddr) {
        let Some(call_id) = request.call_id().cloned() else {
            return;
        };

        if let Some(tx) = self.sessions.get(&call_id).map(|e| e.value().clone()) {
            let _ = tx.send(SessionEvent::Sip { request, peer }).await;
            return;
        }

        if self.sessions.len() >= self.config.max_concurrent_calls {
            warn!(%call_id, active = self.sessions.len(), "at capacity: 486");
            let response = Response::for_request(&request, 486, "Busy Here", None);
            self.sender.send(peer, serialize_response(&response)).await;
            return;
        }

        let from = request.headers.get("From").cloned().unwrap_or_default();
        let (tx, _state) = CallSession::spawn(
            call_id.clone(),
            self.settings.clone(),
            Arc::clone(&self.sender),
            Arc::clone(&self.ai),
            self.events.clone(),
            self.removed_tx.clone(),
        );
        self.sessions.insert(call_id.clone(), tx.clone());
        info!(%call_id, active = self.sessions.len(), "session created");

        let _ = self
            .events
            .incoming_call
            .send(IncomingCall {
                call_id,
                from: SmolStr::new(from),
            })
            .await;
        let _ = tx.send(SessionEvent::Sip { request, peer }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::session::AiLink;
    use ai_realtime::{ConversationItem, ServerEvent};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;

    struct RecordingSender {
        sent: Arc<Mutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl SipSender for RecordingSender {
        async fn send(&self, _target: SocketAddr, payload: Bytes) {
            self.sent.lock().unwrap().push(payload);
        }
    }

    struct NullAi;

    #[async_trait]
    impl AiLink for NullAi {
        async fn attach(&self, _events: mpsc::Sender<ServerEvent>) {}
        async fn configure(&self) {}
        async fn send_audio(&self, _audio: String) {}
        async fn create_item(&self, _item: ConversationItem) {}
        async fn create_response(&self) {}
        async fn detach(&self) {}
    }

    fn test_config(max_calls: usize) -> Arc<Config> {
        Arc::new(Config {
            sip_server: "127.0.0.1:5088".parse().unwrap(),
            sip_server_host: "127.0.0.1".to_string(),
            extension: "30".to_string(),
            password: "pw".to_string(),
            sip_client_port: 5060,
            rtp_port_range: (48000, 48100),
            public_ip: "192.0.2.10".to_string(),
            ai_realtime_url: "ws://127.0.0.1:1".to_string(),
            ai_api_key: "k".to_string(),
            ai_voice: "alloy".to_string(),
            ai_instructions: "i".to_string(),
            ai_welcome_prompt: "w".to_string(),
            max_concurrent_calls: max_calls,
            skip_sip_registration: true,
            session_expires_seconds: 1800,
            bye_filtering: true,
            require_rtp_before_ai: false,
        })
    }

    struct TestBits {
        dispatcher: Dispatcher,
        sent: Arc<Mutex<Vec<Bytes>>>,
        _receivers: events::EventReceivers,
        _removed: mpsc::Receiver<SmolStr>,
    }

    fn build(max_calls: usize) -> TestBits {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sender = Arc::new(RecordingSender { sent: sent.clone() });
        let (event_senders, receivers) = events::channels();
        let (dispatcher, removed_rx) = Dispatcher::new(
            test_config(max_calls),
            sender,
            Arc::new(NullAi),
            None,
            Arc::new(DashMap::new()),
            event_senders,
        );
        TestBits {
            dispatcher,
            sent,
            _receivers: receivers,
            _removed: removed_rx,
        }
    }

    fn datagram(raw: &str) -> InboundDatagram {
        InboundDatagram {
            payload: Bytes::from(raw.to_string().into_bytes()),
            peer: "127.0.0.1:5080".parse().unwrap(),
        }
    }

    fn last_status(sent: &Arc<Mutex<Vec<Bytes>>>) -> String {
        let sent = sent.lock().unwrap();
        let last = sent.last().expect("no response sent");
        String::from_utf8_lossy(last)
            .lines()
            .next()
            .unwrap()
            .to_string()
    }

    const OPTIONS: &str = "OPTIONS sip:30@192.0.2.10 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKopt1\r\n\
        From: <sip:pbx@127.0.0.1>;tag=1\r\n\
        To: <sip:30@192.0.2.10>\r\n\
        Call-ID: opt1@pbx\r\n\
        CSeq: 1 OPTIONS\r\n\
        Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn options_gets_200_with_allow() {
        let bits = build(10);
        bits.dispatcher.handle_datagram(datagram(OPTIONS)).await;
        assert!(last_status(&bits.sent).starts_with("SIP/2.0 200 OK"));
        let body =
            String::from_utf8_lossy(bits.sent.lock().unwrap().last().unwrap()).to_string();
        assert!(body.contains("Allow: INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER, NOTIFY"));
        assert!(body.contains("Accept: application/sdp"));
    }

    #[tokio::test]
    async fn unknown_method_gets_405() {
        let bits = build(10);
        let raw = OPTIONS
            .replace("OPTIONS sip", "SUBSCRIBE sip")
            .replace("1 OPTIONS", "1 SUBSCRIBE");
        bits.dispatcher.handle_datagram(datagram(&raw)).await;
        assert!(last_status(&bits.sent).starts_with("SIP/2.0 405"));
    }

    #[tokio::test]
    async fn bye_without_session_gets_481() {
        let bits = build(10);
        let raw = "BYE sip:30@192.0.2.10 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKbye9\r\n\
            From: <sip:pbx@127.0.0.1>;tag=1\r\n\
            To: <sip:30@192.0.2.10>;tag=2\r\n\
            Call-ID: no-such-call@pbx\r\n\
            CSeq: 2 BYE\r\n\
            Content-Length: 0\r\n\r\n";
        bits.dispatcher.handle_datagram(datagram(raw)).await;
        assert!(last_status(&bits.sent).starts_with("SIP/2.0 481"));
    }

    #[tokio::test]
    async fn missing_mandatory_headers_is_silent() {
        let bits = build(10);
        let raw = "OPTIONS sip:30@192.0.2.10 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKopt2\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        bits.dispatcher.handle_datagram(datagram(raw)).await;
        assert!(bits.sent.lock().unwrap().is_empty());
        assert_eq!(bits.dispatcher.malformed_count(), 1);
    }

    #[tokio::test]
    async fn keepalive_datagrams_are_ignored() {
        let bits = build(10);
        bits.dispatcher.handle_datagram(datagram("\r\n\r\n")).await;
        assert!(bits.sent.lock().unwrap().is_empty());
        assert_eq!(bits.dispatcher.malformed_count(), 0);
    }

    fn invite_raw(call_id: &str) -> String {
        format!(
            "INVITE sip:30@192.0.2.10 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKinv-{}\r\n\
             From: <sip:pbx@127.0.0.1>;tag=1\r\n\
             To: <sip:30@192.0.2.10>\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:pbx@127.0.0.1:5080>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: 124\r\n\r\n\
             v=0\r\n\
             o=pbx 1 1 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             c=IN IP4 127.0.0.1\r\n\
             t=0 0\r\n\
             m=audio 49170 RTP/AVP 0\r\n\
             a=rtpmap:0 PCMU/8000\r\n\
             a=sendrecv\r\n",
            call_id, call_id
        )
    }

    #[tokio::test]
    async fn invite_creates_session_and_capacity_is_enforced() {
        let bits = build(1);
        bits.dispatcher
            .handle_datagram(datagram(&invite_raw("c1@pbx")))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(bits.dispatcher.sessions.len(), 1);

        bits.dispatcher
            .handle_datagram(datagram(&invite_raw("c2@pbx")))
            .await;
        assert!(last_status(&bits.sent).starts_with("SIP/2.0 486"));
        assert_eq!(bits.dispatcher.sessions.len(), 1);
    }
}
