// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Registration engine: keeps the bridge registered as an extension on the
//! upstream PBX and proves to itself that it still is.
//!
//! One REGISTER transaction may be outstanding at any instant. The CSeq
//! counter increases monotonically across every distinct REGISTER the
//! engine ever sends; retransmissions reuse the identical serialized bytes
//! (same branch, same CSeq). On a digest challenge the authenticated
//! request gets a *fresh* Call-ID. That is off-script for RFC 3261, but it
//! matches what deployed soft-clients do and some servers require it.

use std::sync::Arc;

use bytes::Bytes;
use sip_auth::DigestClient;
use sip_core::{
    generate_branch, generate_call_id, generate_tag, parse_digest_challenge, Headers, Method,
    Request, RequestLine, Response, SipUri,
};
use sip_parse::serialize_request;
use sip_transaction::{
    ClientAction, ClientEvent, ClientNonInviteFsm, TimerRegistry, TransactionTimer,
};
use smol_str::SmolStr;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::transport::SipSender;

const USER_AGENT: &str = "parleyd/0.1";
const REGISTER_EXPIRES: u32 = 3600;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const OPTIONS_PING_INTERVAL: Duration = Duration::from_secs(300);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const FAILED_RETRY_BACKOFF: Duration = Duration::from_secs(5);
const REGISTERING_STUCK_AFTER: Duration = Duration::from_secs(30);

/// Registration record state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Failed,
}

/// Self-liveness verdict published for external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Degraded,
}

/// Status event on the client-status channel.
#[derive(Debug, Clone, Copy)]
pub struct ClientStatus {
    pub state: RegistrationState,
    pub liveness: Liveness,
}

/// Engine mailbox events.
#[derive(Debug)]
pub enum RegEvent {
    /// A SIP response whose Call-ID matched one of ours.
    Response(Response),
    Timer(SmolStr),
    /// Transport re-bound; re-register after the settle.
    SocketRecovered,
    /// Send a final un-REGISTER (shutdown path).
    Unregister,
}

struct RegisterCycle {
    call_id: SmolStr,
    fsm: ClientNonInviteFsm,
}

/// The engine task. Owns the registration record exclusively.
pub struct RegistrationEngine {
    config: Arc<Config>,
    sender: Arc<dyn SipSender>,
    rx: mpsc::Receiver<RegEvent>,
    timers: TimerRegistry<RegEvent>,
    status_tx: watch::Sender<ClientStatus>,

    state: RegistrationState,
    cseq: u32,
    cycle: Option<RegisterCycle>,
    digest: DigestClient,
    auth_attempted: bool,
    granted_expires: u32,
    last_success: Option<Instant>,
    registering_since: Option<Instant>,
    options_call_id: Option<SmolStr>,
}

impl RegistrationEngine {
    /// Creates the engine plus its mailbox sender and status receiver.
    pub fn new(
        config: Arc<Config>,
        sender: Arc<dyn SipSender>,
    ) -> (Self, mpsc::Sender<RegEvent>, watch::Receiver<ClientStatus>) {
        let (tx, rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(ClientStatus {
            state: RegistrationState::Unregistered,
            liveness: Liveness::Degraded,
        });
        let timers = TimerRegistry::new(tx.clone());
        let digest = DigestClient::new(&config.extension, &config.password);
        let engine = Self {
            config,
            sender,
            rx,
            timers,
            status_tx,
            state: RegistrationState::Unregistered,
            cseq: 0,
            cycle: None,
            digest,
            auth_attempted: false,
            granted_expires: REGISTER_EXPIRES,
            last_success: None,
            registering_since: None,
            options_call_id: None,
        };
        (engine, tx, status_rx)
    }

    /// Runs the engine until the mailbox closes.
    pub async fn run(mut self) {
        self.start_cycle(None).await;
        self.timers
            .set("keepalive", KEEPALIVE_INTERVAL, RegEvent::Timer("keepalive".into()));
        self.timers.set(
            "options-ping",
            OPTIONS_PING_INTERVAL,
            RegEvent::Timer("options-ping".into()),
        );
        self.timers
            .set("liveness", LIVENESS_INTERVAL, RegEvent::Timer("liveness".into()));

        while let Some(event) = self.rx.recv().await {
            match event {
                RegEvent::Response(response) => self.on_response(response).await,
                RegEvent::Timer(name) => self.on_timer(&name).await,
                RegEvent::SocketRecovered => {
                    info!("socket recovered; re-registering");
                    self.start_cycle(None).await;
                }
                RegEvent::Unregister => {
                    self.send_unregister().await;
                    break;
                }
            }
        }
        self.timers.cancel_all();
    }

    /// Starts a new REGISTER cycle. `authorization` carries the header value
    /// computed from a digest challenge, for the authenticated resend.
    async fn start_cycle(&mut self, authorization: Option<String>) {
        // At most one REGISTER transaction outstanding: starting a cycle
        // abandons any prior one (its timers are re-armed below).
        self.cseq += 1;
        let call_id = generate_call_id(&self.config.public_ip);
        let request = self.build_register(&call_id, self.cseq, authorization.as_deref(), REGISTER_EXPIRES);

        let mut fsm = ClientNonInviteFsm::new();
        let actions = fsm.on_event(ClientEvent::SendRequest(request));
        self.cycle = Some(RegisterCycle {
            call_id: call_id.clone(),
            fsm,
        });
        self.state = RegistrationState::Registering;
        self.registering_since = Some(Instant::now());
        self.publish_status();
        debug!(cseq = self.cseq, %call_id, authenticated = authorization.is_some(), "REGISTER cycle started");
        // Initial send never delivers a response.
        let _ = self.apply_actions(actions).await;
    }

    fn build_register(
        &self,
        call_id: &str,
        cseq: u32,
        authorization: Option<&str>,
        expires: u32,
    ) -> Request {
        let config = &self.config;
        let from_tag = generate_tag();
        let branch = generate_branch();

        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};branch={};rport",
                config.public_ip, config.sip_client_port, branch
            ),
        );
        headers.push("Max-Forwards", "70");
        headers.push("From", format!("<{}>;tag={}", config.aor(), from_tag));
        headers.push("To", format!("<{}>", config.aor()));
        headers.push("Call-ID", call_id);
        headers.push("CSeq", format!("{} REGISTER", cseq));
        headers.push("Contact", format!("<{}>", config.contact_uri()));
        if let Some(authorization) = authorization {
            headers.push("Authorization", authorization);
        }
        headers.push("Expires", expires.to_string());
        headers.push("User-Agent", USER_AGENT);

        let uri = SipUri::parse(&config.server_uri()).unwrap_or(SipUri {
            user: None,
            host: config.sip_server_host.clone().into(),
            port: Some(config.sip_server.port()),
            params: None,
        });
        Request::new(RequestLine::new(Method::Register, uri), headers, Bytes::new())
    }

    async fn on_response(&mut self, response: Response) {
        let call_id = response.call_id().cloned().unwrap_or_default();

        if Some(&call_id) == self.options_call_id.as_ref() {
            debug!(code = response.start.code, "OPTIONS ping answered");
            self.options_call_id = None;
            return;
        }

        let Some(cycle) = self.cycle.as_mut() else {
            debug!(%call_id, "response without active cycle; ignoring");
            return;
        };
        if cycle.call_id != call_id {
            debug!(%call_id, "response for stale cycle; ignoring");
            return;
        }

        let event = if response.is_provisional() {
            ClientEvent::ReceiveProvisional(response)
        } else {
            ClientEvent::ReceiveFinal(response)
        };
        let actions = cycle.fsm.on_event(event);
        if let Some(delivered) = self.apply_actions(actions).await {
            self.on_final_response(delivered).await;
        }
    }

    async fn on_timer(&mut self, name: &str) {
        match name {
            "txn-E" | "txn-F" | "txn-K" => {
                let timer = match name {
                    "txn-E" => TransactionTimer::E,
                    "txn-F" => TransactionTimer::F,
                    _ => TransactionTimer::K,
                };
                if let Some(cycle) = self.cycle.as_mut() {
                    let actions = cycle.fsm.on_event(ClientEvent::TimerFired(timer));
                    let _ = self.apply_actions(actions).await;
                }
            }
            "refresh" => {
                debug!("registration refresh due");
                self.auth_attempted = false;
                self.start_cycle(None).await;
            }
            "retry" => {
                self.auth_attempted = false;
                self.start_cycle(None).await;
            }
            "keepalive" => {
                // RFC 5626 §3.5.1 double-CRLF keep-alive.
                self.sender
                    .send(self.config.sip_server, Bytes::from_static(b"\r\n\r\n"))
                    .await;
                self.timers
                    .set("keepalive", KEEPALIVE_INTERVAL, RegEvent::Timer("keepalive".into()));
            }
            "options-ping" => {
                if self.state == RegistrationState::Registered {
                    self.send_options_ping().await;
                }
                self.timers.set(
                    "options-ping",
                    OPTIONS_PING_INTERVAL,
                    RegEvent::Timer("options-ping".into()),
                );
            }
            "liveness" => {
                self.check_liveness().await;
                self.timers
                    .set("liveness", LIVENESS_INTERVAL, RegEvent::Timer("liveness".into()));
            }
            other => debug!(timer = other, "unknown timer fired"),
        }
    }

    /// Executes FSM actions. A delivered response is returned rather than
    /// handled inline so response handling cannot recurse back through here.
    async fn apply_actions(&mut self, actions: Vec<ClientAction>) -> Option<Response> {
        let mut delivered = None;
        for action in actions {
            match action {
                ClientAction::Transmit(bytes) => {
                    self.sender.send(self.config.sip_server, bytes).await;
                }
                ClientAction::Schedule { timer, duration } => {
                    let name = timer_name(timer);
                    self.timers
                        .set(name, duration, RegEvent::Timer(SmolStr::new(name)));
                }
                ClientAction::Cancel(timer) => self.timers.cancel(timer_name(timer)),
                ClientAction::Deliver(response) => delivered = Some(response),
                ClientAction::Terminate { reason } => {
                    if self.state == RegistrationState::Registering {
                        warn!(%reason, "REGISTER transaction failed");
                        self.enter_failed().await;
                    }
                }
            }
        }
        delivered
    }

    async fn on_final_response(&mut self, response: Response) {
        if response.is_provisional() {
            return;
        }
        match response.start.code {
            200..=299 => self.on_registered(&response),
            401 | 407 => self.on_challenge(&response).await,
            code => {
                warn!(code, "REGISTER rejected");
                self.enter_failed().await;
            }
        }
    }

    fn on_registered(&mut self, response: &Response) {
        let granted = response
            .headers
            .get("Expires")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .or_else(|| contact_expires(response))
            .unwrap_or(REGISTER_EXPIRES);

        self.state = RegistrationState::Registered;
        self.granted_expires = granted.max(1);
        self.last_success = Some(Instant::now());
        self.registering_since = None;
        self.auth_attempted = false;
        self.publish_status();

        // Proactive refresh at half the granted lifetime.
        let refresh_in = Duration::from_secs((self.granted_expires / 2).max(1) as u64);
        self.timers
            .set("refresh", refresh_in, RegEvent::Timer("refresh".into()));
        info!(
            expires = self.granted_expires,
            refresh_secs = refresh_in.as_secs(),
            "registered with upstream"
        );
    }

    async fn on_challenge(&mut self, response: &Response) {
        if self.auth_attempted {
            warn!("challenge after authenticated REGISTER; treating as auth failure");
            self.enter_failed().await;
            return;
        }
        let header = response
            .headers
            .get("WWW-Authenticate")
            .or_else(|| response.headers.get("Proxy-Authenticate"));
        let Some(challenge) = header.and_then(|h| parse_digest_challenge(h)) else {
            warn!("401/407 without parseable digest challenge");
            self.enter_failed().await;
            return;
        };

        let uri = self.config.server_uri();
        let authorization = self
            .digest
            .authorization(&Method::Register, &uri, &challenge);
        self.auth_attempted = true;
        // Fresh Call-ID and CSeq+1 for the authenticated request.
        self.start_cycle(Some(authorization)).await;
    }

    async fn enter_failed(&mut self) {
        self.state = RegistrationState::Failed;
        self.cycle = None;
        self.registering_since = None;
        self.publish_status();
        self.timers
            .set("retry", FAILED_RETRY_BACKOFF, RegEvent::Timer("retry".into()));
    }

    async fn send_options_ping(&mut self) {
        let config = &self.config;
        let call_id = generate_call_id(&config.public_ip);
        self.cseq += 1;

        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};branch={};rport",
                config.public_ip,
                config.sip_client_port,
                generate_branch()
            ),
        );
        headers.push("Max-Forwards", "70");
        headers.push("From", format!("<{}>;tag={}", config.aor(), generate_tag()));
        headers.push("To", format!("<{}>", config.server_uri()));
        headers.push("Call-ID", call_id.clone());
        headers.push("CSeq", format!("{} OPTIONS", self.cseq));
        headers.push("User-Agent", USER_AGENT);

        let Some(uri) = SipUri::parse(&config.server_uri()) else {
            return;
        };
        let request = Request::new(RequestLine::new(Method::Options, uri), headers, Bytes::new());
        self.options_call_id = Some(call_id);
        self.sender
            .send(config.sip_server, serialize_request(&request))
            .await;
        debug!("OPTIONS ping sent");
    }

    /// ALIVE iff the socket is open, we are REGISTERED, the registration has
    /// not silently lapsed, and no REGISTER has been stuck for 30 s.
    async fn check_liveness(&mut self) {
        let registration_fresh = self
            .last_success
            .map(|t| t.elapsed() < Duration::from_secs(self.granted_expires as u64))
            .unwrap_or(false);
        let stuck_registering = self
            .registering_since
            .map(|t| t.elapsed() > REGISTERING_STUCK_AFTER)
            .unwrap_or(false);

        let alive = self.state == RegistrationState::Registered
            && registration_fresh
            && !stuck_registering;

        if alive {
            self.publish(Liveness::Alive);
        } else {
            self.publish(Liveness::Degraded);
            // Degraded means re-register now, unless an attempt is already
            // in flight and not yet stuck, or the Failed backoff timer
            // already owns the retry.
            let retry_pending = self.state == RegistrationState::Failed;
            let registering_ok = self.state == RegistrationState::Registering && !stuck_registering;
            if !registering_ok && !retry_pending {
                debug!("liveness degraded; forcing re-registration");
                self.auth_attempted = false;
                self.start_cycle(None).await;
            }
        }
    }

    fn publish_status(&self) {
        let liveness = self.status_tx.borrow().liveness;
        let _ = self.status_tx.send(ClientStatus {
            state: self.state,
            liveness,
        });
    }

    fn publish(&self, liveness: Liveness) {
        let _ = self.status_tx.send(ClientStatus {
            state: self.state,
            liveness,
        });
    }

    async fn send_unregister(&mut self) {
        self.cseq += 1;
        let call_id = generate_call_id(&self.config.public_ip);
        let request = self.build_register(&call_id, self.cseq, None, 0);
        self.sender
            .send(self.config.sip_server, serialize_request(&request))
            .await;
        info!("unregistered from upstream");
    }
}

fn timer_name(timer: TransactionTimer) -> &'static str {
    match timer {
        TransactionTimer::E => "txn-E",
        TransactionTimer::F => "txn-F",
        TransactionTimer::K => "txn-K",
    }
}

/// Expires parameter on the Contact binding, as some registrars grant it
/// there instead of in an Expires header.
fn contact_expires(response: &Response) -> Option<u32> {
    let contact = response.headers.get("Contact")?;
    contact.split(';').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("expires") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
