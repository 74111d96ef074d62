//! The control surface: list/inspect/terminate
//! dialogs, manage profile membership, and run field-match queries. This
//! module renders engine state into plain records; the actual wire
//! transport (mi_fifo/JSONRPC/whatever) is the caller's concern — these
//! methods only format.

use dialog_util::ArcStr;

use crate::dialog::{Dialog, LEG_CALLEE};
use crate::engine::DialogEngine;
use crate::external::{FieldMatch, MatchOp};
use crate::state::{DialogEvent, DialogState, EndReason};
use crate::{Error, Result};

/// One row of a dialog listing.
#[derive(Debug, Clone)]
pub struct DialogSummary {
    /// Internal identity, rendered `h_entry:h_id`.
    pub iuid: String,
    /// Call-ID.
    pub call_id: String,
    /// From-tag.
    pub from_tag: String,
    /// To-tag, if assigned.
    pub to_tag: Option<String>,
    /// Current lifecycle state.
    pub state: DialogState,
    /// Seconds since `init_ts`.
    pub age_secs: u64,
}

fn summarize(dialog: &Dialog) -> DialogSummary {
    DialogSummary {
        iuid: dialog.iuid().to_string(),
        call_id: dialog.call_id().to_string(),
        from_tag: dialog.from_tag().to_string(),
        to_tag: dialog.to_tag().map(|t| t.to_string()),
        state: dialog.state(),
        age_secs: dialog
            .init_ts()
            .elapsed()
            .unwrap_or(std::time::Duration::ZERO)
            .as_secs(),
    }
}

/// Aggregate counts backing the "active-state statistics" RPC query.
#[derive(Debug, Clone, Copy)]
pub struct DialogStats {
    /// Dialogs currently live in the table, any state.
    pub current: u64,
    /// Total dialogs created since startup.
    pub created_total: u64,
    /// Total dialogs that reached `Confirmed` since startup.
    pub confirmed_total: u64,
}

impl DialogEngine {
    /// Lists every live dialog.
    pub fn rpc_list(&self) -> Vec<DialogSummary> {
        let mut out = Vec::new();
        self.table.for_each(|d| out.push(summarize(d)));
        out
    }

    /// Looks up a single dialog by `(Call-ID, From-tag, To-tag)`.
    pub fn rpc_find(&self, call_id: &str, from_tag: &str, to_tag: &str) -> Result<DialogSummary> {
        self.table
            .lookup_by_tags(call_id, from_tag, to_tag)
            .map(|(d, _)| summarize(&d))
            .ok_or(Error::NotFound)
    }

    /// Terminates a dialog addressed by `(Call-ID, From-tag, To-tag)`,
    /// firing the `ended` callback with [`EndReason::ForcedEnd`].
    pub fn rpc_terminate(&self, call_id: &str, from_tag: &str, to_tag: &str) -> Result<()> {
        let (dialog, _) = self.table.lookup_by_tags(call_id, from_tag, to_tag).ok_or(Error::NotFound)?;
        self.force_end(&dialog, EndReason::ForcedEnd)
    }

    /// Terminates a dialog addressed directly by its internal identity.
    pub fn rpc_end_by_iuid(&self, iuid: crate::dialog::Iuid) -> Result<()> {
        let dialog = self.table.lookup_by_iuid(iuid).ok_or(Error::NotFound)?;
        self.force_end(&dialog, EndReason::ForcedEnd)
    }

    /// Overrides a dialog's lifecycle state via RPC. See
    /// [`DialogEngine::rpc_set_state`] caveats in `dispatch.rs`.
    pub fn rpc_set_dialog_state(&self, call_id: &str, from_tag: &str, to_tag: &str, target: DialogState) -> Result<()> {
        let (dialog, _) = self.table.lookup_by_tags(call_id, from_tag, to_tag).ok_or(Error::NotFound)?;
        self.rpc_set_state(&dialog, target)
    }

    /// Current membership count for `profile`/`value`.
    pub fn rpc_profile_size(&self, profile: &str, value: Option<&str>) -> Result<usize> {
        self.profiles.size(profile, value)
    }

    /// Lists every dialog currently in `profile`/`value`.
    pub fn rpc_profile_list(&self, profile: &str, value: Option<&str>) -> Result<Vec<DialogSummary>> {
        let mut out = Vec::new();
        self.profiles.for_each(profile, value, &self.table, |d| out.push(summarize(d)))?;
        Ok(out)
    }

    /// Aggregate dialog counts.
    pub fn rpc_stats(&self) -> DialogStats {
        DialogStats {
            current: self.table.len() as u64,
            created_total: self.active_counters.created_total(),
            confirmed_total: self.active_counters.confirmed_total(),
        }
    }

    /// Forces an in-dialog event to be re-applied via RPC (e.g. operator
    /// injecting a `BYE` that never actually arrived on the wire). Exposed
    /// distinctly from [`DialogEngine::on_in_dialog_request`] so wire-level
    /// dispatch and RPC-triggered dispatch share the state machine without
    /// sharing a callback-origin tag.
    pub fn rpc_inject_event(&self, iuid: crate::dialog::Iuid, event: DialogEvent) -> Result<DialogState> {
        let dialog = self.table.lookup_by_iuid(iuid).ok_or(Error::NotFound)?;
        dialog.apply_event(event)
    }

    /// Bridges two already-established dialogs: each party is REFERred at
    /// the other's current callee contact, the two-dialog counterpart of
    /// the INVITE(hold)-REFER-BYE bridging mechanism. Issuing the REFERs is
    /// the only part of the bridge that is this module's concern; carrying
    /// out the resulting transfer (the REFER's eventual NOTIFY, the BYE
    /// that tears down the bridged legs) arrives back through the normal
    /// `on_in_dialog_request`/`on_*` call sites like any other in-dialog
    /// traffic.
    pub async fn rpc_bridge(
        &self,
        a_call_id: &str,
        a_from_tag: &str,
        a_to_tag: &str,
        b_call_id: &str,
        b_from_tag: &str,
        b_to_tag: &str,
    ) -> Result<()> {
        let (dialog_a, _) = self.table.lookup_by_tags(a_call_id, a_from_tag, a_to_tag).ok_or(Error::NotFound)?;
        let (dialog_b, _) = self.table.lookup_by_tags(b_call_id, b_from_tag, b_to_tag).ok_or(Error::NotFound)?;

        let contact_a = dialog_a
            .leg(LEG_CALLEE)
            .contact()
            .ok_or_else(|| Error::InputInvalid("dialog a has no callee contact to bridge to".into()))?;
        let contact_b = dialog_b
            .leg(LEG_CALLEE)
            .contact()
            .ok_or_else(|| Error::InputInvalid("dialog b has no callee contact to bridge to".into()))?;

        let refer_to_b = format!("Refer-To: {contact_b}\r\n");
        let refer_to_a = format!("Refer-To: {contact_a}\r\n");

        self.transaction
            .send_request_within(&dialog_a, LEG_CALLEE, "REFER", Some(&refer_to_b), None, None)
            .await?;
        self.transaction
            .send_request_within(&dialog_b, LEG_CALLEE, "REFER", Some(&refer_to_a), None, None)
            .await?;

        Ok(())
    }

    /// Finds dialogs whose field matches `matcher`, supporting a small
    /// query language (`eq`/`re`/`sw`/`gt`/`lt`).
    /// Currently supports matching on `call_id` (`eq`/`sw`/`re`) and
    /// `start_ts` (`gt`/`lt`/`eq`, compared as Unix seconds; a dialog that
    /// hasn't yet reached `ConfirmedNoAck` has no `start_ts` and never
    /// matches).
    pub fn rpc_match(&self, matcher: &FieldMatch) -> Result<Vec<DialogSummary>> {
        let mut out = Vec::new();
        self.table.for_each(|dialog| {
            if field_matches(dialog, matcher) {
                out.push(summarize(dialog));
            }
        });
        Ok(out)
    }
}

fn field_matches(dialog: &Dialog, matcher: &FieldMatch) -> bool {
    match matcher.field.as_ref() {
        "call_id" => match matcher.op {
            MatchOp::Eq => dialog.call_id().as_ref() == matcher.value,
            MatchOp::Sw => dialog.call_id().as_ref().starts_with(matcher.value.as_str()),
            MatchOp::Re => regex_lite_match(dialog.call_id(), &matcher.value),
            _ => false,
        },
        "start_ts" => {
            let Some(start_ts) = dialog.start_ts() else {
                return false;
            };
            let ts = start_ts.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
            let Ok(bound) = matcher.value.parse::<u64>() else {
                return false;
            };
            match matcher.op {
                MatchOp::Gt => ts > bound,
                MatchOp::Lt => ts < bound,
                MatchOp::Eq => ts == bound,
                _ => false,
            }
        }
        _ => false,
    }
}

/// A deliberately tiny substring-based stand-in for a real regex match: no
/// dependency in this workspace pulls in a regex engine, so this avoids
/// adding one for a single query operator.
fn regex_lite_match(haystack: &ArcStr, needle: &str) -> bool {
    haystack.as_ref().contains(needle)
}
