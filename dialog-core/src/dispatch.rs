//! Wires externally observed SIP events into the state machine, the table,
//! the timer ring and the callback registry. This is the part of the
//! source's `dlg_onreq`/`dlg_onroute`/`dlg_reply_cb` call chain that belongs
//! to the dialog core rather than to the transaction engine.

use dialog_util::ArcStr;

use crate::callback::{event_mask, CallbackEvent, LegDirection};
use crate::config::SequentialMatchMode;
use crate::dialog::{iflags, Dialog, Leg, LEG_CALLEE, LEG_CALLER};
use crate::engine::DialogEngine;
use crate::state::{DialogEvent, DialogState, EndReason};
use crate::table::{new_dialog_params, MatchDirection};
use crate::{Error, Result};

/// Fields lifted off an initial dialog-forming request (an `INVITE` with no
/// existing match), gathered by the caller before calling
/// [`DialogEngine::on_initial_request`].
pub struct InitialRequest {
    /// Call-ID.
    pub call_id: ArcStr,
    /// From-tag.
    pub from_tag: ArcStr,
    /// Request-URI.
    pub req_uri: ArcStr,
    /// From-URI.
    pub from_uri: ArcStr,
    /// To-URI.
    pub to_uri: ArcStr,
    /// Caller contact URI.
    pub caller_contact: ArcStr,
    /// CSeq string on the request.
    pub caller_cseq: String,
}

/// Fields lifted off an in-dialog request, used to route it back to its
/// dialog.
pub struct RoutedRequest {
    /// Call-ID.
    pub call_id: ArcStr,
    /// From-tag on the request.
    pub from_tag: ArcStr,
    /// To-tag on the request, if present.
    pub to_tag: ArcStr,
    /// SIP method.
    pub method: String,
    /// Record-Route parameter value carrying this module's IUID, if the
    /// request still had one (stripped by the routing engine beforehand).
    pub rr_param: Option<String>,
}

impl DialogEngine {
    /// Classifies and inserts a brand-new dialog.
    /// Arms the early timer immediately: a dialog with no confirming reply
    /// within `early_timeout` is purged by the cleanup sweep even if no
    /// provisional reply ever arrives.
    pub fn on_initial_request(&self, req: InitialRequest) -> Dialog {
        let params = new_dialog_params(
            req.call_id,
            req.from_tag,
            req.req_uri,
            req.from_uri,
            req.to_uri,
            req.caller_contact,
            req.caller_cseq,
            self.config.default_timeout,
        );
        let dialog = self.table.insert(params);
        if self.config.timeout_noreset {
            dialog.set_iflags(iflags::TIMEOUT_NORESET);
        }
        self.timer.insert(&dialog, self.config.early_timeout);
        self.active_counters.bump_created();
        self.notify_dirty(&dialog);

        self.fire(&dialog, event_mask::CREATED, None, LegDirection::None);
        log::debug!("dialog {} created for call-id {}", dialog.iuid(), dialog.call_id());
        dialog
    }

    /// A provisional (1xx) reply arrived on `dialog`.
    pub fn on_provisional_reply(&self, dialog: &Dialog, to_tag: Option<ArcStr>) -> Result<()> {
        if let Some(tag) = to_tag {
            dialog.leg(LEG_CALLEE).set_tag(tag);
        }
        dialog.apply_event(DialogEvent::Provisional)?;
        self.timer.reschedule(dialog, self.config.early_timeout);
        self.replication.on_state_change(dialog, DialogState::Early);
        self.notify_dirty(dialog);
        self.fire(dialog, event_mask::EARLY, None, LegDirection::Callee);
        Ok(())
    }

    /// A final reply arrived on `dialog`. `status >= 300` rejects the
    /// dialog; `2xx` confirms it (pending the ACK, unless `wait_ack` is
    /// disabled).
    pub fn on_final_reply(&self, dialog: &Dialog, status: u16, to_tag: Option<ArcStr>) -> Result<()> {
        if status >= 300 {
            dialog.apply_event(DialogEvent::FinalFailure)?;
            self.finalize(dialog, EndReason::Rejected);
            self.fire(dialog, event_mask::FAILED, Some(EndReason::Rejected), LegDirection::Callee);
            return Ok(());
        }

        if let Some(tag) = to_tag {
            dialog.leg(LEG_CALLEE).set_tag(tag);
        }
        dialog.apply_event(DialogEvent::FinalOk)?;

        if self.config.wait_ack {
            self.timer.reschedule(dialog, self.config.noack_timeout);
        } else {
            // Open Question (a): skip the ACK wait entirely.
            dialog.apply_event(DialogEvent::Ack)?;
            self.active_counters.bump_confirmed();
            self.timer.reschedule(dialog, dialog_lifetime(dialog));
            self.replication.on_state_change(dialog, DialogState::Confirmed);
            self.notify_dirty(dialog);
            self.fire(dialog, event_mask::CONFIRMED, None, LegDirection::Callee);
            return Ok(());
        }

        self.replication.on_state_change(dialog, DialogState::ConfirmedNoAck);
        self.notify_dirty(dialog);
        Ok(())
    }

    /// The ACK matching the 2xx reply arrived.
    pub fn on_ack(&self, dialog: &Dialog) -> Result<()> {
        dialog.apply_event(DialogEvent::Ack)?;
        self.active_counters.bump_confirmed();
        self.timer.reschedule(dialog, dialog_lifetime(dialog));
        self.replication.on_state_change(dialog, DialogState::Confirmed);
        self.notify_dirty(dialog);
        self.fire(dialog, event_mask::CONFIRMED, None, LegDirection::Caller);
        Ok(())
    }

    /// An in-dialog request other than an initial request arrived, already
    /// matched to `dialog` by [`DialogEngine::route_in_dialog`]. `cseq` is
    /// the request's CSeq string, recorded on the originating leg so a
    /// subsequent request on the same leg can be told apart from a retransmit.
    pub fn on_in_dialog_request(&self, dialog: &Dialog, method: &str, cseq: String, leg: LegDirection) -> Result<()> {
        if method.eq_ignore_ascii_case("BYE") {
            dialog.apply_event(DialogEvent::Bye)?;
            self.finalize(dialog, EndReason::Bye);
            self.fire(dialog, event_mask::ENDED, Some(EndReason::Bye), leg);
            return Ok(());
        }

        dialog.apply_event(DialogEvent::InDialogRequest)?;
        if let Some(idx) = leg_index(leg) {
            dialog.leg(idx).set_cseq(cseq);
        }
        if dialog.reset_timeout_on_traffic() {
            self.timer.reschedule(dialog, dialog_lifetime(dialog));
        }
        self.notify_dirty(dialog);
        self.fire(dialog, event_mask::REQUEST_WITHIN, None, leg);
        Ok(())
    }

    /// Matches an in-dialog request back to its dialog, honoring
    /// `sequential-match-mode`. Also performs spiral detection: a request
    /// that carries this module's own Record-Route IUID a second time (the
    /// call looped back through the same proxy) is reported via
    /// [`iflags::SPIRAL_MATCHED`] rather than being treated as a fresh
    /// in-dialog match.
    pub fn route_in_dialog(&self, req: &RoutedRequest) -> Option<(Dialog, MatchDirection)> {
        let by_id = req
            .rr_param
            .as_deref()
            .and_then(|v| self.routing.decode_iuid(v))
            .and_then(|iuid| self.table.lookup_by_iuid(iuid))
            .map(|d| (d, MatchDirection::Upstream));

        let found = match self.config.sequential_match_mode {
            SequentialMatchMode::StrictId => by_id,
            SequentialMatchMode::Fallback => {
                by_id.or_else(|| self.table.lookup_by_tags(&req.call_id, &req.from_tag, &req.to_tag))
            }
            SequentialMatchMode::NoId => self.table.lookup_by_tags(&req.call_id, &req.from_tag, &req.to_tag),
        };

        if let Some((dialog, _)) = &found {
            if self.config.detect_spirals && dialog.iflags() & iflags::SPIRAL_MATCHED != 0 {
                log::debug!("dialog {} re-matched via Record-Route, spiral suppressed", dialog.iuid());
            } else if self.config.detect_spirals {
                dialog.set_iflags(iflags::SPIRAL_MATCHED);
            }
        }

        found
    }

    /// Applies `keep_proxy_rr` trimming (keeps up to 3 trailing Record-Route
    /// entries contributed by intermediate proxies on a re-INVITE) and
    /// stores the resulting route set on `leg`.
    pub fn apply_route_set(&self, leg: &Leg, mut route_set: Vec<ArcStr>) {
        let keep = self.config.keep_proxy_rr as usize;
        if keep > 0 && route_set.len() > keep {
            let drop_from = route_set.len() - keep;
            route_set.drain(0..drop_from);
        }
        leg.set_route_set(route_set);
    }

    /// Forces `dialog` to end outside of normal BYE handling, e.g. from the
    /// RPC control surface or a keepalive-failure sweep.
    pub fn force_end(&self, dialog: &Dialog, reason: EndReason) -> Result<()> {
        dialog.apply_event(DialogEvent::ForcedEnd)?;
        dialog.set_end_reason_raw(reason);
        self.finalize(dialog, reason);
        let kind = match reason {
            EndReason::Expired | EndReason::KeepaliveFailed => event_mask::EXPIRED,
            _ => event_mask::ENDED,
        };
        self.fire(dialog, kind, Some(reason), LegDirection::None);
        Ok(())
    }

    /// Best-effort arbitrary state override via RPC (Open Question (b)):
    /// accepted even when it does not correspond to a normal transition, via
    /// the raw state setter rather than `apply_event`, but never re-arms
    /// timers or touches profile membership — the caller is expected to
    /// follow up with the matching timer/profile bookkeeping if needed.
    pub fn rpc_set_state(&self, dialog: &Dialog, target: DialogState) -> Result<()> {
        let current = dialog.state();
        if target == DialogState::Deleted && current != DialogState::Deleted {
            return self.force_end(dialog, EndReason::ForcedEnd);
        }
        if !current.can_advance_to(target) {
            return Err(Error::Conflict { from: current, event: "rpc-set-state" });
        }
        dialog.set_state_raw(target);
        dialog.mark_dirty();
        self.replication.on_state_change(dialog, target);
        self.notify_dirty(dialog);
        log::warn!("dialog {} force-set to {} via rpc, best effort", dialog.iuid(), target);
        Ok(())
    }

    fn finalize(&self, dialog: &Dialog, reason: EndReason) {
        let _ = reason;
        self.timer.cancel(dialog);
        self.profiles.unlink_all(dialog);
        self.table.unlink(dialog);
        dialog.mark_dirty();
        self.replication.on_state_change(dialog, DialogState::Deleted);
        self.notify_dirty(dialog);
    }

    fn fire(&self, dialog: &Dialog, kind: u32, end_reason: Option<EndReason>, leg: LegDirection) {
        self.callbacks.dispatch(&CallbackEvent { dialog, kind, end_reason, leg });
    }
}

fn dialog_lifetime(dialog: &Dialog) -> std::time::Duration {
    std::time::Duration::from_secs(dialog.lifetime())
}

/// Maps a [`LegDirection`] back to a leg index, for call sites that need to
/// mutate the leg that originated a message. `None` has no corresponding leg.
fn leg_index(leg: LegDirection) -> Option<usize> {
    match leg {
        LegDirection::Caller => Some(LEG_CALLER),
        LegDirection::Callee => Some(LEG_CALLEE),
        LegDirection::None => None,
    }
}

/// Convenience re-export so callers matching on a leg direction from
/// [`crate::table::MatchDirection`] can map it to a [`LegDirection`]
/// without importing both enums.
pub fn leg_direction(dir: MatchDirection) -> LegDirection {
    match dir {
        MatchDirection::Upstream => LegDirection::Caller,
        MatchDirection::Downstream => LegDirection::Callee,
    }
}
