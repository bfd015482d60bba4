// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-call session state machine.
//!
//! One instance per dialog. All inputs (SIP requests, inbound RTP, AI
//! events, timer firings) arrive through the session's mailbox and are
//! processed serially, so session state needs no locks. The machine walks
//! Idle → Proceeding → Confirmed → MediaReady → AiActive → Terminated;
//! anything else asked of it is logged and refused.
//!
//! The BYE disposition deliberately privileges call continuity over strict
//! RFC compliance: production PBXs emit spurious BYEs during call setup,
//! and dropping a live caller is worse than absorbing a protocol wart. The
//! filter can be disabled for integration testing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ai_realtime::{ConversationItem, RealtimeHandle, ServerEvent};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use rtp_media::{spawn_pacer, G711Codec, PacerHandle, RtpSession};
use sip_core::{
    generate_branch, generate_tag, parse_answer_mode, parse_contact_uri, parse_cseq, parse_reason,
    parse_session_expires, tag_param, AnswerMode, Headers, Method, Request, RequestLine, Response,
    SipUri,
};
use sip_parse::{serialize_request, serialize_response};
use sip_sdp::{build_audio_answer, negotiate_audio, parse_sdp, NegotiatedAudio};
use sip_transaction::TimerRegistry;
use smol_str::SmolStr;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{CallEnded, EventSenders};
use crate::transport::SipSender;

const RING_DELAY: Duration = Duration::from_millis(100);
const AUTO_ANSWER_DELAY: Duration = Duration::from_millis(100);
const MANUAL_ANSWER_DELAY: Duration = Duration::from_secs(1);
const ACK_TIMEOUT: Duration = Duration::from_secs(32);
const MEDIA_VALIDATION: Duration = Duration::from_secs(2);
const BYE_GRACE_AFTER_CONFIRM: Duration = Duration::from_secs(3);
const BYE_STALE_AUDIO: Duration = Duration::from_secs(30);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Proceeding,
    Confirmed,
    MediaReady,
    AiActive,
    Terminated,
}

/// Everything that can land in a session's mailbox.
#[derive(Debug)]
pub enum SessionEvent {
    Sip { request: Request, peer: SocketAddr },
    Timer(SmolStr),
    Ai(ServerEvent),
    /// First (or any) inbound RTP packet was seen.
    RtpArrived,
    /// One inbound G.711 payload from the caller.
    CallerFrame(Bytes),
    /// Process shutdown or supervisor-initiated teardown.
    Terminate,
}

/// Session-level knobs lifted out of the process config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub extension: String,
    pub server_host: String,
    pub public_ip: String,
    pub contact_uri: String,
    pub rtp_port_range: (u16, u16),
    pub bye_filtering: bool,
    pub require_rtp_before_ai: bool,
    pub welcome_prompt: String,
    pub session_expires_seconds: u32,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            extension: config.extension.clone(),
            server_host: config.sip_server_host.clone(),
            public_ip: config.public_ip.clone(),
            contact_uri: config.contact_uri(),
            rtp_port_range: config.rtp_port_range,
            bye_filtering: config.bye_filtering,
            require_rtp_before_ai: config.require_rtp_before_ai,
            welcome_prompt: config.ai_welcome_prompt.clone(),
            session_expires_seconds: config.session_expires_seconds,
        }
    }
}

/// Seam to the AI realtime client.
#[async_trait]
pub trait AiLink: Send + Sync + 'static {
    async fn attach(&self, events: mpsc::Sender<ServerEvent>);
    async fn configure(&self);
    async fn send_audio(&self, audio: String);
    async fn create_item(&self, item: ConversationItem);
    async fn create_response(&self);
    async fn detach(&self);
}

#[async_trait]
impl AiLink for RealtimeHandle {
    async fn attach(&self, events: mpsc::Sender<ServerEvent>) {
        RealtimeHandle::attach(self, events).await;
    }
    async fn configure(&self) {
        RealtimeHandle::configure(self).await;
    }
    async fn send_audio(&self, audio: String) {
        RealtimeHandle::send_audio(self, audio).await;
    }
    async fn create_item(&self, item: ConversationItem) {
        RealtimeHandle::create_item(self, item).await;
    }
    async fn create_response(&self) {
        RealtimeHandle::create_response(self).await;
    }
    async fn detach(&self) {
        RealtimeHandle::detach(self).await;
    }
}

/// Dialog bookkeeping (RFC 3261 §12).
#[derive(Debug, Default)]
struct Dialog {
    local_tag: SmolStr,
    remote_tag: Option<SmolStr>,
    remote_target: Option<SipUri>,
    remote_seq: u32,
    local_seq: u32,
}

/// Wall-clock facts feeding the BYE disposition.
struct ActivityTracker {
    call_start: Instant,
    last_audio: Instant,
    ai_response_in_progress: bool,
    welcome_active: bool,
    pending_cleanup: bool,
}

impl ActivityTracker {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            call_start: now,
            last_audio: now,
            ai_response_in_progress: false,
            welcome_active: false,
            pending_cleanup: false,
        }
    }
}

/// What the BYE disposition decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByeDisposition {
    Teardown,
    Defer,
    Ignore,
}

pub struct CallSession {
    call_id: SmolStr,
    settings: SessionSettings,
    sender: Arc<dyn SipSender>,
    ai: Arc<dyn AiLink>,
    events: EventSenders,
    removed_tx: mpsc::Sender<SmolStr>,
    self_tx: mpsc::Sender<SessionEvent>,
    timers: TimerRegistry<SessionEvent>,
    state_tx: watch::Sender<SessionState>,

    state: SessionState,
    dialog: Dialog,
    activity: ActivityTracker,
    caller_addr: Option<SocketAddr>,
    answer_mode: AnswerMode,
    invite: Option<Request>,
    last_response: Option<Response>,
    negotiated: Option<NegotiatedAudio>,
    sdp_answer: Option<String>,
    local_rtp_port: u16,
    pacer: Option<PacerHandle>,
    /// Wire codec of the call. The AI leg is always μ-law, so A-law calls
    /// transcode at this boundary.
    codec: Option<G711Codec>,
    answered: bool,
    media_seen: bool,
    confirmed_at: Option<Instant>,
    peer_session_expires: Option<u32>,
}

impl CallSession {
    /// Builds and spawns a session task. Returns the mailbox sender and a
    /// state observer.
    pub fn spawn(
        call_id: SmolStr,
        settings: SessionSettings,
        sender: Arc<dyn SipSender>,
        ai: Arc<dyn AiLink>,
        events: EventSenders,
        removed_tx: mpsc::Sender<SmolStr>,
    ) -> (mpsc::Sender<SessionEvent>, watch::Receiver<SessionState>) {
        let (tx, rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let timers = TimerRegistry::new(tx.clone());

        let session = Self {
            call_id,
            settings,
            sender,
            ai,
            events,
            removed_tx,
            self_tx: tx.clone(),
            timers,
            state_tx,
            state: SessionState::Idle,
            dialog: Dialog {
                local_tag: generate_tag(),
                ..Dialog::default()
            },
            activity: ActivityTracker::new(),
            caller_addr: None,
            answer_mode: AnswerMode::Manual,
            invite: None,
            last_response: None,
            negotiated: None,
            sdp_answer: None,
            local_rtp_port: 0,
            pacer: None,
            codec: None,
            answered: false,
            media_seen: false,
            confirmed_at: None,
            peer_session_expires: None,
        };
        tokio::spawn(session.run(rx));
        (tx, state_rx)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
            if self.state == SessionState::Terminated {
                break;
            }
        }
        self.timers.cancel_all();
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Sip { request, peer } => self.on_sip(request, peer).await,
            SessionEvent::Timer(name) => self.on_timer(&name).await,
            SessionEvent::Ai(event) => self.on_ai(event).await,
            SessionEvent::RtpArrived => self.on_rtp_arrived().await,
            SessionEvent::CallerFrame(payload) => self.on_caller_frame(payload).await,
            SessionEvent::Terminate => self.teardown("terminated by supervisor").await,
        }
    }

    // ---- state machine -------------------------------------------------

    /// Applies a transition if the DAG allows it. Illegal transitions are
    /// logged and leave the state unchanged.
    fn transition(&mut self, to: SessionState) -> bool {
        use SessionState::*;
        let allowed = matches!(
            (self.state, to),
            (Idle, Proceeding)
                | (Proceeding, Confirmed)
                | (Confirmed, MediaReady)
                | (MediaReady, AiActive)
                | (_, Terminated)
        );
        if !allowed {
            warn!(
                call_id = %self.call_id,
                from = ?self.state,
                to = ?to,
                "illegal session transition refused"
            );
            return false;
        }
        debug!(call_id = %self.call_id, from = ?self.state, to = ?to, "session transition");
        self.state = to;
        let _ = self.state_tx.send(to);
        true
    }

    // ---- SIP handling --------------------------------------------------

    async fn on_sip(&mut self, request: Request, peer: SocketAddr) {
        match request.start.method.clone() {
            Method::Invite => self.on_invite(request, peer).await,
            Method::Ack => self.on_ack().await,
            Method::Bye => self.on_bye(request, peer).await,
            Method::Cancel => self.on_cancel(request).await,
            other => {
                debug!(call_id = %self.call_id, method = %other, "in-dialog request answered 200");
                let response = Response::for_request(&request, 200, "OK", None);
                self.send_response(&response, peer).await;
            }
        }
    }

    async fn on_invite(&mut self, request: Request, peer: SocketAddr) {
        let cseq = request
            .headers
            .get("CSeq")
            .and_then(|v| parse_cseq(v))
            .map(|c| c.seq)
            .unwrap_or(1);

        if self.state != SessionState::Idle {
            if cseq <= self.dialog.remote_seq {
                // Retransmission: replay whatever we last said.
                if let Some(last) = self.last_response.clone() {
                    debug!(call_id = %self.call_id, cseq, "INVITE retransmission; replaying response");
                    self.send_response(&last, peer).await;
                }
            } else {
                self.on_reinvite(request, peer, cseq).await;
            }
            return;
        }

        // Fresh dialog.
        self.dialog.remote_seq = cseq;
        self.dialog.remote_tag = request.headers.get("From").and_then(|f| tag_param(f));
        self.dialog.remote_target = request
            .headers
            .get("Contact")
            .and_then(|c| parse_contact_uri(c))
            .or_else(|| {
                request
                    .headers
                    .get("From")
                    .and_then(|f| parse_contact_uri(f))
            });
        self.caller_addr = Some(peer);
        self.answer_mode = request
            .headers
            .get("Answer-Mode")
            .or_else(|| request.headers.get("Priv-Answer-Mode"))
            .and_then(|v| parse_answer_mode(v))
            .unwrap_or(AnswerMode::Manual);
        self.peer_session_expires = request
            .headers
            .get("Session-Expires")
            .and_then(|v| parse_session_expires(v))
            .map(|se| se.seconds);

        // Negotiate audio before committing to the call.
        let offer_text = String::from_utf8_lossy(&request.body).into_owned();
        let negotiated = match parse_sdp(&offer_text).map_err(|e| e.to_string()).and_then(|sdp| {
            negotiate_audio(&sdp).map_err(|e| e.to_string())
        }) {
            Ok(negotiated) => negotiated,
            Err(reason) => {
                info!(call_id = %self.call_id, %reason, "rejecting INVITE: 488");
                let response = Response::for_request(
                    &request,
                    488,
                    "Not Acceptable Here",
                    Some(self.dialog.local_tag.as_str()),
                );
                self.send_response(&response, peer).await;
                self.transition(SessionState::Terminated);
                self.emit_removed("no common codec").await;
                return;
            }
        };

        if !self.setup_media(&negotiated).await {
            let response = Response::for_request(
                &request,
                503,
                "Service Unavailable",
                Some(self.dialog.local_tag.as_str()),
            );
            self.send_response(&response, peer).await;
            self.transition(SessionState::Terminated);
            self.emit_removed("media setup failed").await;
            return;
        }
        self.negotiated = Some(negotiated);

        if !self.transition(SessionState::Proceeding) {
            return;
        }
        info!(
            call_id = %self.call_id,
            peer = %peer,
            remote_tag = ?self.dialog.remote_tag,
            auto_answer = self.answer_mode == AnswerMode::Auto,
            "incoming call"
        );

        let trying = Response::for_request(&request, 100, "Trying", None);
        self.send_response(&trying, peer).await;
        self.last_response = Some(trying);
        self.invite = Some(request);

        self.timers
            .set("ring", RING_DELAY, SessionEvent::Timer("ring".into()));
    }

    async fn on_reinvite(&mut self, request: Request, peer: SocketAddr, cseq: u32) {
        // Session refresh (RFC 4028) or hold/resume; we re-answer with the
        // established SDP and keep the media path untouched.
        debug!(call_id = %self.call_id, cseq, "re-INVITE; re-answering with current SDP");
        self.dialog.remote_seq = cseq;
        let mut response =
            Response::for_request(&request, 200, "OK", Some(self.dialog.local_tag.as_str()));
        response.headers.push("Contact", format!("<{}>", self.settings.contact_uri));
        if let Some(sdp) = &self.sdp_answer {
            response.headers.push("Content-Type", "application/sdp");
            response.body = Bytes::from(sdp.clone().into_bytes());
        }
        self.send_response(&response, peer).await;
        self.last_response = Some(response);
    }

    async fn on_ack(&mut self) {
        if !self.answered {
            debug!(call_id = %self.call_id, "ACK before answer ignored");
            return;
        }
        if self.state != SessionState::Proceeding {
            return;
        }
        self.timers.cancel("ack-timeout");
        if !self.transition(SessionState::Confirmed) {
            return;
        }
        self.confirmed_at = Some(Instant::now());

        // Media validation: proceed on first RTP packet or optimistically
        // when the window closes (asymmetric NAT paths are common).
        self.timers.set(
            "media-validation",
            MEDIA_VALIDATION,
            SessionEvent::Timer("media-validation".into()),
        );

        if let Some(expires) = self.peer_session_expires {
            let refresh_in = Duration::from_secs(expires.saturating_sub(30).max(1) as u64);
            self.timers.set(
                "session-refresh",
                refresh_in,
                SessionEvent::Timer("session-refresh".into()),
            );
        }
    }

    async fn on_bye(&mut self, request: Request, peer: SocketAddr) {
        // Protocol first: BYE always gets its 200, whatever we decide.
        let response = Response::for_request(&request, 200, "OK", None);
        self.send_response(&response, peer).await;

        let disposition = self.classify_bye(&request, peer);
        match disposition {
            ByeDisposition::Teardown => {
                info!(call_id = %self.call_id, "BYE accepted; tearing down");
                self.teardown("caller hangup").await;
            }
            ByeDisposition::Defer => {
                info!(call_id = %self.call_id, "BYE deferred until response completes");
                self.activity.pending_cleanup = true;
            }
            ByeDisposition::Ignore => {
                warn!(call_id = %self.call_id, %peer, "spurious BYE ignored; call continues");
            }
        }
    }

    /// The premature-BYE filter. See module docs for why this exists.
    fn classify_bye(&self, request: &Request, peer: SocketAddr) -> ByeDisposition {
        if !self.settings.bye_filtering {
            return ByeDisposition::Teardown;
        }

        let source_matches = self.caller_addr == Some(peer);
        let reason_is_hangup = request
            .headers
            .get("Reason")
            .map(|r| {
                let text = parse_reason(r).to_lowercase();
                text.contains("user") || text.contains("normal") || text.contains("hangup")
            })
            .unwrap_or(false);
        let call_established = self
            .confirmed_at
            .map(|t| t.elapsed() > BYE_GRACE_AFTER_CONFIRM)
            .unwrap_or(false);

        if source_matches || reason_is_hangup || call_established {
            return ByeDisposition::Teardown;
        }
        if self.activity.welcome_active {
            return ByeDisposition::Ignore;
        }
        if self.activity.ai_response_in_progress {
            return ByeDisposition::Defer;
        }
        if self.activity.last_audio.elapsed() > BYE_STALE_AUDIO {
            return ByeDisposition::Teardown;
        }
        ByeDisposition::Ignore
    }

    async fn on_cancel(&mut self, request: Request) {
        let peer = self.caller_addr.unwrap_or(([0, 0, 0, 0], 0).into());
        let ok = Response::for_request(&request, 200, "OK", None);
        self.send_response(&ok, peer).await;

        if self.answered || self.state != SessionState::Proceeding {
            debug!(call_id = %self.call_id, "CANCEL after answer has no effect");
            return;
        }
        if let Some(invite) = self.invite.clone() {
            let terminated = Response::for_request(
                &invite,
                487,
                "Request Terminated",
                Some(self.dialog.local_tag.as_str()),
            );
            self.send_response(&terminated, peer).await;
        }
        self.teardown("cancelled").await;
    }

    // ---- timers --------------------------------------------------------

    async fn on_timer(&mut self, name: &str) {
        match name {
            "ring" => self.send_ringing().await,
            "answer" => self.send_answer().await,
            "ack-timeout" => {
                warn!(call_id = %self.call_id, "no ACK within transaction window");
                self.teardown("ACK timeout").await;
            }
            "media-validation" => {
                if self.state == SessionState::Confirmed {
                    if self.settings.require_rtp_before_ai && !self.media_seen {
                        debug!(call_id = %self.call_id, "holding AI activation for first RTP packet");
                    } else {
                        self.media_ready().await;
                    }
                }
            }
            "session-refresh" => self.send_session_refresh().await,
            other => debug!(call_id = %self.call_id, timer = other, "unknown timer fired"),
        }
    }

    async fn send_ringing(&mut self) {
        let Some(invite) = self.invite.clone() else { return };
        let Some(peer) = self.caller_addr else { return };

        let ringing =
            Response::for_request(&invite, 180, "Ringing", Some(self.dialog.local_tag.as_str()));
        self.send_response(&ringing, peer).await;
        self.last_response = Some(ringing);

        let delay = match self.answer_mode {
            AnswerMode::Auto => AUTO_ANSWER_DELAY,
            AnswerMode::Manual => MANUAL_ANSWER_DELAY,
        };
        self.timers
            .set("answer", delay, SessionEvent::Timer("answer".into()));
    }

    async fn send_answer(&mut self) {
        let Some(invite) = self.invite.clone() else { return };
        let Some(peer) = self.caller_addr else { return };
        let Some(negotiated) = self.negotiated.clone() else { return };

        let sdp = build_audio_answer(
            &self.settings.public_ip,
            self.local_rtp_port,
            negotiated.payload_type,
            &negotiated.encoding_name,
            rand::random::<u16>() as u32,
            1,
        );

        let mut response =
            Response::for_request(&invite, 200, "OK", Some(self.dialog.local_tag.as_str()));
        response.headers.push("Contact", format!("<{}>", self.settings.contact_uri));
        response.headers.push("Allow", "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER, NOTIFY");
        if self.peer_session_expires.is_some() {
            response.headers.push(
                "Session-Expires",
                format!("{};refresher=uas", self.settings.session_expires_seconds),
            );
        }
        response.headers.push("Content-Type", "application/sdp");
        response.body = Bytes::from(sdp.clone().into_bytes());

        self.send_response(&response, peer).await;
        self.last_response = Some(response);
        self.sdp_answer = Some(sdp);
        self.answered = true;

        self.timers.set(
            "ack-timeout",
            ACK_TIMEOUT,
            SessionEvent::Timer("ack-timeout".into()),
        );
    }

    async fn send_session_refresh(&mut self) {
        let Some(peer) = self.caller_addr else { return };
        if self.state == SessionState::Terminated {
            return;
        }
        self.dialog.local_seq += 1;

        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {};branch={}",
                self.settings.public_ip,
                generate_branch()
            ),
        );
        headers.push("Max-Forwards", "70");
        headers.push(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.settings.extension, self.settings.server_host, self.dialog.local_tag
            ),
        );
        let to = self
            .invite
            .as_ref()
            .and_then(|i| i.headers.get("From").cloned())
            .unwrap_or_default();
        headers.push("To", to);
        headers.push("Call-ID", self.call_id.clone());
        headers.push("CSeq", format!("{} INVITE", self.dialog.local_seq));
        headers.push("Contact", format!("<{}>", self.settings.contact_uri));
        headers.push(
            "Session-Expires",
            format!("{};refresher=uas", self.settings.session_expires_seconds),
        );
        headers.push("Content-Type", "application/sdp");

        let target = self
            .dialog
            .remote_target
            .clone()
            .unwrap_or_else(|| SipUri {
                user: None,
                host: self.settings.server_host.clone().into(),
                port: None,
                params: None,
            });
        let body = self
            .sdp_answer
            .clone()
            .map(|s| Bytes::from(s.into_bytes()))
            .unwrap_or_default();
        let request = Request::new(RequestLine::new(Method::Invite, target), headers, body);
        self.sender.send(peer, serialize_request(&request)).await;
        debug!(call_id = %self.call_id, "session refresh re-INVITE sent");

        if let Some(expires) = self.peer_session_expires {
            let refresh_in = Duration::from_secs(expires.saturating_sub(30).max(1) as u64);
            self.timers.set(
                "session-refresh",
                refresh_in,
                SessionEvent::Timer("session-refresh".into()),
            );
        }
    }

    // ---- media ---------------------------------------------------------

    /// Binds the RTP socket, wires the receive path into the mailbox, and
    /// parks the send path behind the pacer.
    async fn setup_media(&mut self, negotiated: &NegotiatedAudio) -> bool {
        let mut rtp = match RtpSession::bind(
            self.settings.rtp_port_range,
            negotiated.payload_type,
        )
        .await
        {
            Ok(rtp) => rtp,
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "RTP bind failed");
                return false;
            }
        };
        self.local_rtp_port = rtp.local_port();

        if let Ok(ip) = negotiated.remote_host.parse::<IpAddr>() {
            rtp.set_remote(SocketAddr::new(ip, negotiated.remote_port));
        } else {
            warn!(
                call_id = %self.call_id,
                host = %negotiated.remote_host,
                "offer connection address is not an IP; media egress disabled"
            );
        }

        // Inbound: RTP socket -> mailbox.
        let mut inbound = rtp.spawn_receiver();
        let mailbox = self.self_tx.clone();
        tokio::spawn(async move {
            let mut first = true;
            while let Some(frame) = inbound.recv().await {
                if first {
                    first = false;
                    if mailbox.send(SessionEvent::RtpArrived).await.is_err() {
                        return;
                    }
                }
                if mailbox
                    .send(SessionEvent::CallerFrame(frame.payload))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        // Outbound: pacer -> RTP socket, 20 ms cadence.
        let (pacer, mut paced) = spawn_pacer();
        tokio::spawn(async move {
            while let Some(frame) = paced.recv().await {
                if let Err(e) = rtp.send_frame(&frame).await {
                    debug!(error = %e, "paced frame dropped");
                }
            }
        });
        self.pacer = Some(pacer);
        self.codec = G711Codec::from_encoding_name(&negotiated.encoding_name);
        true
    }

    /// Caller audio toward the AI: A-law calls re-encode to μ-law.
    fn caller_to_ai(&self, payload: &[u8]) -> Vec<u8> {
        match self.codec {
            Some(G711Codec::Pcma) => {
                let pcm = G711Codec::Pcma.decode(payload);
                G711Codec::Pcmu.encode(&pcm)
            }
            _ => payload.to_vec(),
        }
    }

    /// AI audio toward the caller: μ-law back to the negotiated codec.
    fn ai_to_caller(&self, audio: Vec<u8>) -> Vec<u8> {
        match self.codec {
            Some(G711Codec::Pcma) => {
                let pcm = G711Codec::Pcmu.decode(&audio);
                G711Codec::Pcma.encode(&pcm)
            }
            _ => audio,
        }
    }

    async fn on_rtp_arrived(&mut self) {
        self.media_seen = true;
        self.activity.last_audio = Instant::now();
        if self.state == SessionState::Confirmed {
            self.timers.cancel("media-validation");
            self.media_ready().await;
        }
    }

    async fn on_caller_frame(&mut self, payload: Bytes) {
        self.activity.last_audio = Instant::now();
        if matches!(
            self.state,
            SessionState::MediaReady | SessionState::AiActive
        ) {
            let audio = self.caller_to_ai(&payload);
            self.ai.send_audio(BASE64.encode(&audio)).await;
        }
    }

    async fn media_ready(&mut self) {
        if !self.transition(SessionState::MediaReady) {
            return;
        }
        // Bind this call to the AI client and (re)configure the session;
        // AI_ACTIVE waits for the provider's session.updated.
        let (ai_tx, mut ai_rx) = mpsc::channel::<ServerEvent>(32);
        let mailbox = self.self_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = ai_rx.recv().await {
                if mailbox.send(SessionEvent::Ai(event)).await.is_err() {
                    return;
                }
            }
        });
        self.ai.attach(ai_tx).await;
        self.ai.configure().await;
    }

    // ---- AI events -----------------------------------------------------

    async fn on_ai(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionUpdated { .. } => {
                if self.state == SessionState::MediaReady {
                    if !self.transition(SessionState::AiActive) {
                        return;
                    }
                    self.activity.welcome_active = true;
                    self.activity.ai_response_in_progress = true;
                    self.ai
                        .create_item(ConversationItem::user_text(&self.settings.welcome_prompt))
                        .await;
                    self.ai.create_response().await;
                    info!(call_id = %self.call_id, "AI active; welcome requested");
                }
            }
            ServerEvent::SessionCreated { .. } | ServerEvent::ConversationItemCreated => {}
            ServerEvent::SpeechStarted | ServerEvent::SpeechStopped => {
                self.activity.last_audio = Instant::now();
            }
            ServerEvent::ResponseAudioDelta { delta } => {
                if self.state != SessionState::AiActive {
                    warn!(
                        call_id = %self.call_id,
                        state = ?self.state,
                        "AI audio before activation dropped"
                    );
                    return;
                }
                self.activity.ai_response_in_progress = true;
                self.activity.last_audio = Instant::now();
                match BASE64.decode(delta.as_bytes()) {
                    Ok(audio) => {
                        let audio = self.ai_to_caller(audio);
                        if let Some(pacer) = &self.pacer {
                            pacer.enqueue(Bytes::from(audio));
                        }
                    }
                    Err(e) => debug!(call_id = %self.call_id, error = %e, "undecodable audio delta"),
                }
            }
            ServerEvent::ResponseAudioDone => {
                self.activity.last_audio = Instant::now();
            }
            ServerEvent::ResponseTextDelta { .. } => {}
            ServerEvent::ResponseDone => {
                self.activity.welcome_active = false;
                self.activity.ai_response_in_progress = false;
                if self.activity.pending_cleanup {
                    info!(call_id = %self.call_id, "deferred BYE cleanup firing");
                    self.teardown("deferred caller hangup").await;
                }
            }
            ServerEvent::FunctionCallArgumentsDone { name, arguments, .. } => {
                self.on_tool_call(name.as_deref().unwrap_or(""), &arguments).await;
            }
            ServerEvent::Error { error } => {
                if error.is_fatal() {
                    warn!(call_id = %self.call_id, code = ?error.code, "fatal AI error");
                    self.teardown("AI session invalidated").await;
                }
            }
            ServerEvent::Unknown => {}
        }
    }

    async fn on_tool_call(&mut self, name: &str, arguments: &str) {
        match name {
            "end_call" => {
                info!(call_id = %self.call_id, "AI requested hangup");
                self.send_bye().await;
                self.teardown("AI hangup").await;
            }
            "transfer_call" => {
                // Transfer is acknowledged but not executed (no REFER leg).
                info!(call_id = %self.call_id, arguments, "transfer requested; acknowledged only");
            }
            other => debug!(call_id = %self.call_id, tool = other, "unknown tool call ignored"),
        }
    }

    // ---- egress helpers ------------------------------------------------

    async fn send_response(&self, response: &Response, peer: SocketAddr) {
        self.sender.send(peer, serialize_response(response)).await;
    }

    async fn send_bye(&mut self) {
        let Some(peer) = self.caller_addr else { return };
        self.dialog.local_seq += 1;

        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {};branch={}",
                self.settings.public_ip,
                generate_branch()
            ),
        );
        headers.push("Max-Forwards", "70");
        headers.push(
            "From",
            format!(
                "<sip:{}@{}>;tag={}",
                self.settings.extension, self.settings.server_host, self.dialog.local_tag
            ),
        );
        let to = self
            .invite
            .as_ref()
            .and_then(|i| i.headers.get("From").cloned())
            .unwrap_or_default();
        headers.push("To", to);
        headers.push("Call-ID", self.call_id.clone());
        headers.push("CSeq", format!("{} BYE", self.dialog.local_seq));

        let target = self
            .dialog
            .remote_target
            .clone()
            .unwrap_or_else(|| SipUri {
                user: None,
                host: self.settings.server_host.clone().into(),
                port: None,
                params: None,
            });
        let request = Request::new(RequestLine::new(Method::Bye, target), headers, Bytes::new());
        self.sender.send(peer, serialize_request(&request)).await;
    }

    async fn teardown(&mut self, reason: &str) {
        if self.state == SessionState::Terminated {
            return;
        }
        info!(
            call_id = %self.call_id,
            reason,
            duration_secs = self.activity.call_start.elapsed().as_secs(),
            "session teardown"
        );
        self.transition(SessionState::Terminated);
        self.timers.cancel_all();
        // Dropping the pacer handle closes the paced channel; the RTP
        // forwarder and socket wind down with it.
        self.pacer = None;
        self.ai.detach().await;
        self.emit_removed(reason).await;
    }

    async fn emit_removed(&self, reason: &str) {
        let _ = self
            .events
            .call_ended
            .send(CallEnded {
                call_id: self.call_id.clone(),
                reason: SmolStr::new(reason),
            })
            .await;
        let _ = self.removed_tx.send(self.call_id.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use std::sync::Mutex;

    struct RecordingSender {
        tx: mpsc::UnboundedSender<(Instant, Bytes)>,
    }

    #[async_trait]
    impl SipSender for RecordingSender {
        async fn send(&self, _target: SocketAddr, payload: Bytes) {
            let _ = self.tx.send((Instant::now(), payload));
        }
    }

    #[derive(Default)]
    struct TestAi {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AiLink for TestAi {
        async fn attach(&self, _events: mpsc::Sender<ServerEvent>) {
            self.calls.lock().unwrap().push("attach".into());
        }
        async fn configure(&self) {
            self.calls.lock().unwrap().push("configure".into());
        }
        async fn send_audio(&self, audio: String) {
            self.calls.lock().unwrap().push(format!("audio:{}", audio));
        }
        async fn create_item(&self, _item: ConversationItem) {
            self.calls.lock().unwrap().push("create_item".into());
        }
        async fn create_response(&self) {
            self.calls.lock().unwrap().push("create_response".into());
        }
        async fn detach(&self) {
            self.calls.lock().unwrap().push("detach".into());
        }
    }

    fn settings(rtp_base: u16) -> SessionSettings {
        SessionSettings {
            extension: "30".to_string(),
            server_host: "122.163.120.156".to_string(),
            public_ip: "192.0.2.10".to_string(),
            contact_uri: "sip:30@192.0.2.10:5060".to_string(),
            rtp_port_range: (rtp_base, rtp_base + 100),
            bye_filtering: true,
            require_rtp_before_ai: false,
            welcome_prompt: "greet".to_string(),
            session_expires_seconds: 1800,
        }
    }

    fn invite(call_id: &str, auto: bool, media_port: u16) -> Request {
        let sdp = format!(
            "v=0\r\no=pbx 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {} RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\na=sendrecv\r\n",
            media_port
        );
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKcall1");
        headers.push("Max-Forwards", "70");
        headers.push("From", "\"PBX\" <sip:100@122.163.120.156>;tag=pbx-tag-1");
        headers.push("To", "<sip:30@122.163.120.156>");
        headers.push("Call-ID", call_id);
        headers.push("CSeq", "1 INVITE");
        headers.push("Contact", "<sip:100@127.0.0.1:5080>");
        if auto {
            headers.push("Answer-Mode", "Auto");
        }
        headers.push("Content-Type", "application/sdp");
        Request::new(
            RequestLine::new(
                Method::Invite,
                SipUri::parse("sip:30@192.0.2.10").unwrap(),
            ),
            headers,
            Bytes::from(sdp.into_bytes()),
        )
    }

    fn ack(call_id: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKack1");
        headers.push("From", "<sip:100@122.163.120.156>;tag=pbx-tag-1");
        headers.push("To", "<sip:30@122.163.120.156>;tag=x");
        headers.push("Call-ID", call_id);
        headers.push("CSeq", "1 ACK");
        Request::new(
            RequestLine::new(Method::Ack, SipUri::parse("sip:30@192.0.2.10").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn bye(call_id: &str, reason: Option<&str>) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKbye1");
        headers.push("From", "<sip:100@122.163.120.156>;tag=pbx-tag-1");
        headers.push("To", "<sip:30@122.163.120.156>;tag=x");
        headers.push("Call-ID", call_id);
        headers.push("CSeq", "2 BYE");
        if let Some(reason) = reason {
            headers.push("Reason", reason);
        }
        Request::new(
            RequestLine::new(Method::Bye, SipUri::parse("sip:30@192.0.2.10").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    struct Harness {
        tx: mpsc::Sender<SessionEvent>,
        state: watch::Receiver<SessionState>,
        wire: mpsc::UnboundedReceiver<(Instant, Bytes)>,
        ai: Arc<TestAi>,
        _ended: events::EventReceivers,
        _removed: mpsc::Receiver<SmolStr>,
    }

    fn harness(rtp_base: u16) -> Harness {
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let sender = Arc::new(RecordingSender { tx: wire_tx });
        let ai = Arc::new(TestAi::default());
        let (event_senders, event_receivers) = events::channels();
        let (removed_tx, removed_rx) = mpsc::channel(8);

        let (tx, state) = CallSession::spawn(
            SmolStr::new("call-1@pbx"),
            settings(rtp_base),
            sender,
            ai.clone(),
            event_senders,
            removed_tx,
        );
        Harness {
            tx,
            state,
            wire: wire_rx,
            ai,
            _ended: event_receivers,
            _removed: removed_rx,
        }
    }

    fn caller_addr() -> SocketAddr {
        "127.0.0.1:5080".parse().unwrap()
    }

    fn status_line(payload: &Bytes) -> String {
        String::from_utf8_lossy(payload)
            .lines()
            .next()
            .unwrap_or("")
            .to_string()
    }

    async fn drive_to_ai_active(h: &mut Harness, rtp_media_port: u16) {
        h.tx.send(SessionEvent::Sip {
            request: invite("call-1@pbx", true, rtp_media_port),
            peer: caller_addr(),
        })
        .await
        .unwrap();

        // 100 Trying, 180 Ringing, 200 OK.
        for expected in ["SIP/2.0 100", "SIP/2.0 180", "SIP/2.0 200"] {
            let (_, payload) = h.wire.recv().await.unwrap();
            assert!(status_line(&payload).starts_with(expected));
        }

        h.tx.send(SessionEvent::Sip {
            request: ack("call-1@pbx"),
            peer: caller_addr(),
        })
        .await
        .unwrap();

        // Media validation window elapses; AI configuration follows.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(*h.state.borrow(), SessionState::MediaReady);

        h.tx.send(SessionEvent::Ai(ServerEvent::SessionUpdated {
            session: Default::default(),
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*h.state.borrow(), SessionState::AiActive);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_answer_timing_matches_rfc5373() {
        let mut h = harness(45000);
        let start = Instant::now();
        h.tx.send(SessionEvent::Sip {
            request: invite("call-1@pbx", true, 45090),
            peer: caller_addr(),
        })
        .await
        .unwrap();

        let (t_trying, trying) = h.wire.recv().await.unwrap();
        assert!(status_line(&trying).starts_with("SIP/2.0 100 Trying"));
        assert!(t_trying - start < Duration::from_millis(10));

        let (t_ringing, ringing) = h.wire.recv().await.unwrap();
        assert!(status_line(&ringing).starts_with("SIP/2.0 180 Ringing"));
        let ring_offset = t_ringing - start;
        assert!(
            ring_offset >= Duration::from_millis(80) && ring_offset <= Duration::from_millis(120),
            "180 at {:?}",
            ring_offset
        );

        let (t_ok, ok) = h.wire.recv().await.unwrap();
        assert!(status_line(&ok).starts_with("SIP/2.0 200 OK"));
        let ok_offset = t_ok - start;
        assert!(
            ok_offset >= Duration::from_millis(170) && ok_offset <= Duration::from_millis(230),
            "200 at {:?}",
            ok_offset
        );

        let text = String::from_utf8_lossy(&ok);
        assert!(text.contains("Content-Type: application/sdp"));
        assert!(text.contains("a=rtpmap:0 PCMU/8000"));
        assert!(text.contains("a=sendrecv"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_answer_waits_a_second() {
        let mut h = harness(45200);
        let start = Instant::now();
        h.tx.send(SessionEvent::Sip {
            request: invite("call-1@pbx", false, 45290),
            peer: caller_addr(),
        })
        .await
        .unwrap();

        let _ = h.wire.recv().await.unwrap(); // 100
        let _ = h.wire.recv().await.unwrap(); // 180
        let (t_ok, ok) = h.wire.recv().await.unwrap();
        assert!(status_line(&ok).starts_with("SIP/2.0 200"));
        let offset = t_ok - start;
        assert!(
            offset >= Duration::from_millis(1000) && offset <= Duration::from_millis(1200),
            "200 at {:?}",
            offset
        );
    }

    #[tokio::test(start_paused = true)]
    async fn premature_bye_from_unknown_source_is_ignored() {
        let mut h = harness(45400);
        drive_to_ai_active(&mut h, 45490).await;

        // BYE from an address that is not the caller's signaling address,
        // no Reason header, within the grace window... but welcome active.
        let spoofed: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        h.tx.send(SessionEvent::Sip {
            request: bye("call-1@pbx", None),
            peer: spoofed,
        })
        .await
        .unwrap();

        // Protocol answer still goes out.
        let (_, payload) = h.wire.recv().await.unwrap();
        assert!(status_line(&payload).starts_with("SIP/2.0 200 OK"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.state.borrow(), SessionState::AiActive, "session must survive");
    }

    #[tokio::test(start_paused = true)]
    async fn bye_from_caller_tears_down() {
        let mut h = harness(45600);
        drive_to_ai_active(&mut h, 45690).await;

        h.tx.send(SessionEvent::Sip {
            request: bye("call-1@pbx", None),
            peer: caller_addr(),
        })
        .await
        .unwrap();

        let (_, payload) = h.wire.recv().await.unwrap();
        assert!(status_line(&payload).starts_with("SIP/2.0 200 OK"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.state.borrow(), SessionState::Terminated);
        assert!(h.ai.calls.lock().unwrap().contains(&"detach".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn bye_with_hangup_reason_tears_down_even_from_unknown_source() {
        let mut h = harness(45800);
        drive_to_ai_active(&mut h, 45890).await;

        let spoofed: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        h.tx.send(SessionEvent::Sip {
            request: bye("call-1@pbx", Some("Q.850;cause=16;text=\"Normal call clearing\"")),
            peer: spoofed,
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.state.borrow(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn bye_during_response_is_deferred_until_response_done() {
        let mut h = harness(46000);
        drive_to_ai_active(&mut h, 46090).await;

        // Welcome finished; a later response is in flight.
        h.tx.send(SessionEvent::Ai(ServerEvent::ResponseDone)).await.unwrap();
        h.tx.send(SessionEvent::Ai(ServerEvent::ResponseAudioDelta {
            delta: BASE64.encode([0xFFu8; 160]),
        }))
        .await
        .unwrap();

        let spoofed: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        h.tx.send(SessionEvent::Sip {
            request: bye("call-1@pbx", None),
            peer: spoofed,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *h.state.borrow(),
            SessionState::AiActive,
            "teardown must wait for response.done"
        );

        h.tx.send(SessionEvent::Ai(ServerEvent::ResponseDone)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.state.borrow(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn bye_filtering_disabled_honors_every_bye() {
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let sender = Arc::new(RecordingSender { tx: wire_tx });
        let ai = Arc::new(TestAi::default());
        let (event_senders, event_receivers) = events::channels();
        let (removed_tx, removed_rx) = mpsc::channel(8);
        let mut s = settings(46200);
        s.bye_filtering = false;

        let (tx, state) = CallSession::spawn(
            SmolStr::new("call-1@pbx"),
            s,
            sender,
            ai.clone(),
            event_senders,
            removed_tx,
        );
        let mut h = Harness {
            tx,
            state,
            wire: wire_rx,
            ai,
            _ended: event_receivers,
            _removed: removed_rx,
        };
        drive_to_ai_active(&mut h, 46290).await;

        let spoofed: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        h.tx.send(SessionEvent::Sip {
            request: bye("call-1@pbx", None),
            peer: spoofed,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.state.borrow(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn ai_audio_outside_ai_active_is_dropped() {
        let mut h = harness(46400);
        h.tx.send(SessionEvent::Sip {
            request: invite("call-1@pbx", true, 46490),
            peer: caller_addr(),
        })
        .await
        .unwrap();
        for _ in 0..3 {
            let _ = h.wire.recv().await.unwrap();
        }

        // Deltas injected in Proceeding must not panic, must not activate.
        h.tx.send(SessionEvent::Ai(ServerEvent::ResponseAudioDelta {
            delta: BASE64.encode([0xFFu8; 160]),
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*h.state.borrow(), SessionState::Proceeding);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_answer_yields_487() {
        let mut h = harness(46600);
        h.tx.send(SessionEvent::Sip {
            request: invite("call-1@pbx", false, 46690),
            peer: caller_addr(),
        })
        .await
        .unwrap();
        let _ = h.wire.recv().await.unwrap(); // 100

        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKcall1");
        headers.push("From", "<sip:100@122.163.120.156>;tag=pbx-tag-1");
        headers.push("To", "<sip:30@122.163.120.156>");
        headers.push("Call-ID", "call-1@pbx");
        headers.push("CSeq", "1 CANCEL");
        let cancel = Request::new(
            RequestLine::new(Method::Cancel, SipUri::parse("sip:30@192.0.2.10").unwrap()),
            headers,
            Bytes::new(),
        );
        h.tx.send(SessionEvent::Sip {
            request: cancel,
            peer: caller_addr(),
        })
        .await
        .unwrap();

        // Collect until we see both the CANCEL's 200 and the INVITE's 487.
        let mut saw_200 = false;
        let mut saw_487 = false;
        for _ in 0..4 {
            match h.wire.recv().await {
                Some((_, payload)) => {
                    let line = status_line(&payload);
                    if line.starts_with("SIP/2.0 200") {
                        saw_200 = true;
                    }
                    if line.starts_with("SIP/2.0 487") {
                        saw_487 = true;
                    }
                    if saw_200 && saw_487 {
                        break;
                    }
                }
                None => break,
            }
        }
        assert!(saw_200 && saw_487);
        assert_eq!(*h.state.borrow(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn invite_retransmission_replays_last_response() {
        let mut h = harness(46800);
        h.tx.send(SessionEvent::Sip {
            request: invite("call-1@pbx", true, 46890),
            peer: caller_addr(),
        })
        .await
        .unwrap();
        for _ in 0..3 {
            let _ = h.wire.recv().await.unwrap();
        }

        // Same CSeq again: the 200 OK must be replayed, not re-processed.
        h.tx.send(SessionEvent::Sip {
            request: invite("call-1@pbx", true, 46890),
            peer: caller_addr(),
        })
        .await
        .unwrap();
        let (_, replay) = h.wire.recv().await.unwrap();
        assert!(status_line(&replay).starts_with("SIP/2.0 200"));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_audio_is_forwarded_once_media_ready() {
        let mut h = harness(47000);
        drive_to_ai_active(&mut h, 47090).await;

        h.tx.send(SessionEvent::CallerFrame(Bytes::from(vec![0xFFu8; 160])))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = h.ai.calls.lock().unwrap();
        assert!(
            calls.iter().any(|c| c.starts_with("audio:")),
            "caller frame must reach the AI link: {:?}",
            *calls
        );
    }

    #[tokio::test(start_paused = true)]
    async fn state_watch_reports_terminated_on_supervisor_terminate() {
        let mut h = harness(47200);
        drive_to_ai_active(&mut h, 47290).await;

        h.tx.send(SessionEvent::Terminate).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*h.state.borrow(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn ai_audio_in_ai_active_reaches_the_wire_as_rtp() {
        // Bind the "caller's" media socket first so the SDP offer points at
        // a real receiver.
        let media = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let media_port = media.local_addr().unwrap().port();

        let mut h = harness(47400);
        drive_to_ai_active(&mut h, media_port).await;

        // Two frames of AI speech.
        h.tx.send(SessionEvent::Ai(ServerEvent::ResponseAudioDelta {
            delta: BASE64.encode([0xFFu8; 320]),
        }))
        .await
        .unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = media.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 172, "12-byte header plus one 160-byte frame");
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1] & 0x7F, 0, "payload type must be PCMU");

        let (len2, _) = media.recv_from(&mut buf).await.unwrap();
        assert_eq!(len2, 172);
    }

    #[tokio::test(start_paused = true)]
    async fn pcma_calls_transcode_toward_the_ai() {
        let mut h = harness(47600);

        // Offer lists A-law only.
        let sdp = format!(
            "v=0\r\no=pbx 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {} RTP/AVP 8\r\na=rtpmap:8 PCMA/8000\r\na=sendrecv\r\n",
            47690
        );
        let mut request = invite("call-1@pbx", true, 47690);
        request.body = Bytes::from(sdp.into_bytes());
        h.tx.send(SessionEvent::Sip {
            request,
            peer: caller_addr(),
        })
        .await
        .unwrap();
        for _ in 0..3 {
            let _ = h.wire.recv().await.unwrap();
        }
        h.tx.send(SessionEvent::Sip {
            request: ack("call-1@pbx"),
            peer: caller_addr(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        h.tx.send(SessionEvent::Ai(ServerEvent::SessionUpdated {
            session: Default::default(),
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*h.state.borrow(), SessionState::AiActive);

        // A-law silence in; the AI must be handed μ-law.
        let alaw_frame = vec![0xD5u8; 160];
        let expected = {
            let pcm = G711Codec::Pcma.decode(&alaw_frame);
            G711Codec::Pcmu.encode(&pcm)
        };
        h.tx.send(SessionEvent::CallerFrame(Bytes::from(alaw_frame)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = h.ai.calls.lock().unwrap();
        let sent = calls
            .iter()
            .find_map(|c| c.strip_prefix("audio:"))
            .expect("caller audio must reach the AI");
        assert_eq!(
            BASE64.decode(sent).unwrap(),
            expected,
            "A-law input must be re-encoded as μ-law for the AI"
        );
    }
}
