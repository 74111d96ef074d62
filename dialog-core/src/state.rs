//! The dialog lifecycle state machine.

use std::fmt;

/// Lifecycle state of a dialog. Ordered so that `PartialOrd`/`Ord` reflect
/// the monotone progression `Unconfirmed -> Early -> ConfirmedNoAck ->
/// Confirmed -> Deleted`; a dialog is never allowed to move to a lower
/// ordinal (see [`DialogState::can_advance_to`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DialogState {
    /// Created on an initial dialog-forming request, no reply observed yet.
    Unconfirmed = 0,
    /// A provisional (1xx) reply was observed.
    Early = 1,
    /// A 2xx final reply was observed; waiting for the ACK.
    ConfirmedNoAck = 2,
    /// The ACK was observed (or `wait_ack` is disabled); the dialog is active.
    Confirmed = 3,
    /// The dialog has ended; it is no longer reachable from the table.
    Deleted = 4,
}

impl DialogState {
    /// Whether transitioning from `self` to `next` respects monotonicity.
    /// Equal states are allowed (e.g. `Confirmed -> Confirmed` on in-dialog
    /// traffic) but no transition may move backwards.
    pub fn can_advance_to(self, next: DialogState) -> bool {
        next >= self
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DialogState::Unconfirmed => "unconfirmed",
            DialogState::Early => "early",
            DialogState::ConfirmedNoAck => "confirmed-no-ack",
            DialogState::Confirmed => "confirmed",
            DialogState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DialogState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unconfirmed" => Ok(DialogState::Unconfirmed),
            "early" => Ok(DialogState::Early),
            "confirmed-no-ack" | "confirmed_na" => Ok(DialogState::ConfirmedNoAck),
            "confirmed" => Ok(DialogState::Confirmed),
            "deleted" => Ok(DialogState::Deleted),
            other => Err(crate::Error::InputInvalid(format!("unknown state name '{other}'"))),
        }
    }
}

/// Why a dialog left the `Deleted` state, attached to the `ended`/`expired`
/// callback payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// A final reply >= 300 arrived before the dialog was confirmed.
    Rejected,
    /// A `BYE` was observed on either leg.
    Bye,
    /// The timer ring expired the dialog (no-ACK, early, or lifetime timeout).
    Expired,
    /// A keepalive failure limit was reached.
    KeepaliveFailed,
    /// An operator ended the dialog via the RPC control surface.
    ForcedEnd,
}

/// The externally observed events that drive [`DialogState`] transitions,
/// per the transition table in the component design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogEvent {
    /// A 1xx provisional reply.
    Provisional,
    /// A 2xx final reply.
    FinalOk,
    /// A final reply with status >= 300.
    FinalFailure,
    /// The ACK matching the 2xx reply.
    Ack,
    /// A `BYE` from either leg.
    Bye,
    /// An in-dialog request other than BYE (re-INVITE, UPDATE, etc.).
    InDialogRequest,
    /// The timer ring expired this dialog.
    TimerExpiry,
    /// An operator forced the dialog to end via RPC.
    ForcedEnd,
}

impl DialogEvent {
    /// Name used in [`crate::Error::Conflict`] and log lines.
    pub fn name(self) -> &'static str {
        match self {
            DialogEvent::Provisional => "provisional",
            DialogEvent::FinalOk => "final-2xx",
            DialogEvent::FinalFailure => "final-failure",
            DialogEvent::Ack => "ack",
            DialogEvent::Bye => "bye",
            DialogEvent::InDialogRequest => "in-dialog-request",
            DialogEvent::TimerExpiry => "timer-expiry",
            DialogEvent::ForcedEnd => "forced-end",
        }
    }
}
