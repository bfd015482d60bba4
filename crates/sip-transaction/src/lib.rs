// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client transaction machinery for the bridge's outbound requests.
//!
//! The bridge only originates non-INVITE requests (REGISTER, OPTIONS, and
//! mid-dialog refreshes), so a single RFC 3261 §17.1.2 state machine covers
//! every client transaction. The FSM is pure: events in, actions out, no I/O,
//! which is what makes the retransmission schedule testable.
//!
//! The [`TimerRegistry`] implements the named-timer contract used across the
//! daemon: setting a timer under an existing name cancels the prior one, and
//! a fired timer that finds its owner gone is a no-op.

mod fsm;
mod registry;

pub use fsm::{ClientAction, ClientEvent, ClientNonInviteFsm, ClientState};
pub use registry::TimerRegistry;

use sip_core::Request;
use smol_str::SmolStr;

/// Timers of the non-INVITE client transaction (RFC 3261 §17.1.2.2).
///
/// E drives retransmission (T1 doubling to T2), F is the transaction
/// timeout (64×T1), K lingers in Completed to absorb late retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    E,
    F,
    K,
}

/// Extracts the `branch=` parameter from a Via header value.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Returns the branch ID of the request's top Via, if one is present.
pub fn request_branch_id(req: &Request) -> Option<SmolStr> {
    let via = req.headers.get("Via")?;
    branch_from_via(via).map(|b| SmolStr::new(b.to_owned()))
}
