use std::time::Duration;

use bytes::Bytes;
use sip_core::{Request, Response};
use sip_parse::serialize_request;
use smol_str::SmolStr;

use crate::TransactionTimer;

/// Non-INVITE client transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Events that drive the client transaction state machine.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the state machine for the runtime to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Transmit(Bytes),
    Deliver(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Terminate {
        reason: SmolStr,
    },
}

/// RFC 3261 Figure 7 for non-INVITE client transactions, with the bridge's
/// retransmission cap: the request is abandoned after six retransmissions
/// even if Timer F has not fired yet.
pub struct ClientNonInviteFsm {
    pub state: ClientState,
    t1: Duration,
    t2: Duration,
    t4: Duration,
    e_interval: Duration,
    retransmits: u32,
    max_retransmits: u32,
    last_request: Option<Bytes>,
}

impl ClientNonInviteFsm {
    /// Creates an FSM with the RFC default timer values.
    pub fn new() -> Self {
        Self::with_timers(
            Duration::from_millis(500),
            Duration::from_secs(4),
            Duration::from_secs(5),
        )
    }

    /// Creates an FSM with custom T1/T2/T4 values (test hook).
    pub fn with_timers(t1: Duration, t2: Duration, t4: Duration) -> Self {
        Self {
            state: ClientState::Trying,
            t1,
            t2,
            t4,
            e_interval: t1,
            retransmits: 0,
            max_retransmits: 6,
            last_request: None,
        }
    }

    /// Serialized bytes of the in-flight request, once sent.
    pub fn request_bytes(&self) -> Option<&Bytes> {
        self.last_request.as_ref()
    }

    /// Handles an event, returning the resulting actions.
    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        match (self.state, event) {
            (ClientState::Trying, ClientEvent::SendRequest(request)) => {
                self.handle_initial_send(request)
            }
            (
                ClientState::Trying | ClientState::Proceeding,
                ClientEvent::ReceiveProvisional(response),
            ) => self.handle_provisional(response),
            (
                ClientState::Trying | ClientState::Proceeding,
                ClientEvent::ReceiveFinal(response),
            ) => self.handle_final(response),
            (
                ClientState::Trying | ClientState::Proceeding,
                ClientEvent::TimerFired(TransactionTimer::E),
            ) => self.handle_timer_e(),
            (
                ClientState::Trying | ClientState::Proceeding,
                ClientEvent::TimerFired(TransactionTimer::F),
            ) => self.handle_timeout("Timer F expired"),
            (ClientState::Completed, ClientEvent::TimerFired(TransactionTimer::K)) => {
                self.state = ClientState::Terminated;
                vec![ClientAction::Terminate {
                    reason: SmolStr::new("completed"),
                }]
            }
            (_, ClientEvent::TransportError) => self.handle_timeout("transport error"),
            _ => Vec::new(),
        }
    }

    fn handle_initial_send(&mut self, request: Request) -> Vec<ClientAction> {
        let bytes = serialize_request(&request);
        self.last_request = Some(bytes.clone());
        vec![
            ClientAction::Transmit(bytes),
            ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.t1,
            },
            ClientAction::Schedule {
                timer: TransactionTimer::F,
                duration: self.t1.saturating_mul(64),
            },
        ]
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientState::Proceeding;
        vec![ClientAction::Deliver(response)]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientState::Completed;
        vec![
            ClientAction::Deliver(response),
            ClientAction::Cancel(TransactionTimer::E),
            ClientAction::Cancel(TransactionTimer::F),
            ClientAction::Schedule {
                timer: TransactionTimer::K,
                duration: self.t4,
            },
        ]
    }

    fn handle_timer_e(&mut self) -> Vec<ClientAction> {
        if self.retransmits >= self.max_retransmits {
            return self.handle_timeout("retransmission limit reached");
        }
        self.retransmits += 1;
        self.e_interval = (self.e_interval * 2).min(self.t2);
        // Identical bytes on every retransmission: same branch, same CSeq.
        match &self.last_request {
            Some(request) => vec![
                ClientAction::Transmit(request.clone()),
                ClientAction::Schedule {
                    timer: TransactionTimer::E,
                    duration: self.e_interval,
                },
            ],
            None => Vec::new(),
        }
    }

    fn handle_timeout(&mut self, reason: &str) -> Vec<ClientAction> {
        if self.state == ClientState::Terminated {
            return Vec::new();
        }
        self.state = ClientState::Terminated;
        vec![
            ClientAction::Cancel(TransactionTimer::E),
            ClientAction::Cancel(TransactionTimer::F),
            ClientAction::Terminate {
                reason: SmolStr::new(reason),
            },
        ]
    }
}

impl Default for ClientNonInviteFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{Headers, Method, RequestLine, SipUri, StatusLine};

    fn register_request() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKreg1");
        headers.push("From", "<sip:30@pbx>;tag=t1");
        headers.push("To", "<sip:30@pbx>");
        headers.push("Call-ID", "reg1@192.0.2.10");
        headers.push("CSeq", "1 REGISTER");
        Request::new(
            RequestLine::new(Method::Register, SipUri::parse("sip:pbx").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn final_response() -> Response {
        Response::new(StatusLine::new(200, "OK"), Headers::new(), Bytes::new())
    }

    #[test]
    fn initial_send_arms_e_and_f() {
        let mut fsm = ClientNonInviteFsm::new();
        let actions = fsm.on_event(ClientEvent::SendRequest(register_request()));

        assert!(matches!(actions[0], ClientAction::Transmit(_)));
        assert_eq!(
            actions[1],
            ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration: Duration::from_millis(500),
            }
        );
        assert_eq!(
            actions[2],
            ClientAction::Schedule {
                timer: TransactionTimer::F,
                duration: Duration::from_secs(32),
            }
        );
    }

    #[test]
    fn retransmission_doubles_until_t2_and_reuses_bytes() {
        let mut fsm = ClientNonInviteFsm::new();
        let initial = fsm.on_event(ClientEvent::SendRequest(register_request()));
        let ClientAction::Transmit(first_bytes) = &initial[0] else {
            panic!("expected transmit");
        };

        let mut expected = [1000u64, 2000, 4000, 4000, 4000, 4000].into_iter();
        for _ in 0..6 {
            let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::E));
            let ClientAction::Transmit(bytes) = &actions[0] else {
                panic!("expected retransmit");
            };
            assert_eq!(bytes, first_bytes, "retransmission must be byte-identical");
            assert_eq!(
                actions[1],
                ClientAction::Schedule {
                    timer: TransactionTimer::E,
                    duration: Duration::from_millis(expected.next().unwrap()),
                }
            );
        }
    }

    #[test]
    fn seventh_retransmission_abandons() {
        let mut fsm = ClientNonInviteFsm::new();
        fsm.on_event(ClientEvent::SendRequest(register_request()));
        for _ in 0..6 {
            fsm.on_event(ClientEvent::TimerFired(TransactionTimer::E));
        }
        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::E));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate { .. })));
        assert_eq!(fsm.state, ClientState::Terminated);
    }

    #[test]
    fn final_response_completes_and_arms_k() {
        let mut fsm = ClientNonInviteFsm::new();
        fsm.on_event(ClientEvent::SendRequest(register_request()));
        let actions = fsm.on_event(ClientEvent::ReceiveFinal(final_response()));

        assert!(matches!(actions[0], ClientAction::Deliver(_)));
        assert!(actions.contains(&ClientAction::Cancel(TransactionTimer::E)));
        assert!(actions.contains(&ClientAction::Cancel(TransactionTimer::F)));
        assert!(actions.contains(&ClientAction::Schedule {
            timer: TransactionTimer::K,
            duration: Duration::from_secs(5),
        }));
        assert_eq!(fsm.state, ClientState::Completed);
    }

    #[test]
    fn timer_f_terminates() {
        let mut fsm = ClientNonInviteFsm::new();
        fsm.on_event(ClientEvent::SendRequest(register_request()));
        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::F));
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientAction::Terminate { .. })));
    }

    #[test]
    fn provisional_moves_to_proceeding_but_keeps_retransmitting() {
        let mut fsm = ClientNonInviteFsm::new();
        fsm.on_event(ClientEvent::SendRequest(register_request()));
        let provisional = Response::new(
            StatusLine::new(100, "Trying"),
            Headers::new(),
            Bytes::new(),
        );
        fsm.on_event(ClientEvent::ReceiveProvisional(provisional));
        assert_eq!(fsm.state, ClientState::Proceeding);

        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::E));
        assert!(matches!(actions[0], ClientAction::Transmit(_)));
    }

    #[test]
    fn late_events_in_terminated_are_ignored() {
        let mut fsm = ClientNonInviteFsm::new();
        fsm.on_event(ClientEvent::SendRequest(register_request()));
        fsm.on_event(ClientEvent::TimerFired(TransactionTimer::F));
        assert!(fsm
            .on_event(ClientEvent::ReceiveFinal(final_response()))
            .is_empty());
    }
}
