//! The dialog record and the state-machine actions that mutate it.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use dialog_util::ArcStr;

use crate::state::{DialogEvent, DialogState, EndReason};
use crate::vars::DialogVar;
use crate::Result;

/// Caller leg index.
pub const LEG_CALLER: usize = 0;
/// Callee leg index.
pub const LEG_CALLEE: usize = 1;

/// `dflags`: persistence dirty bits.
pub mod dflags {
    /// At least one persisted field changed since the last flush.
    pub const DIRTY: u32 = 1 << 0;
    /// The record has never been written to the persistence backend.
    pub const NEW: u32 = 1 << 1;
}

/// `iflags`: internal flags not visible to scripts.
pub mod iflags {
    /// Issue keepalive `OPTIONS` towards the caller leg.
    pub const KA_SRC: u32 = 1 << 0;
    /// Issue keepalive `OPTIONS` towards the callee leg.
    pub const KA_DST: u32 = 1 << 1;
    /// In-dialog traffic must not rearm the lifetime timer.
    pub const TIMEOUT_NORESET: u32 = 1 << 2;
    /// Dialog was located via the spiral-detection Record-Route parameter.
    pub const SPIRAL_MATCHED: u32 = 1 << 3;
}

/// Internal Unique Identity: a (shard, monotonically increasing counter)
/// pair assigned at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iuid {
    /// Shard the dialog lives in, `hash(Call-ID) mod N_shards`.
    pub hash_entry: u32,
    /// Per-shard monotonically increasing counter.
    pub hash_id: u64,
}

impl fmt::Display for Iuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_entry, self.hash_id)
    }
}

/// Per-leg mutable state: tag, contact, last CSeq, route set, bound socket.
#[derive(Default)]
pub struct Leg {
    tag: Mutex<Option<ArcStr>>,
    contact: Mutex<Option<ArcStr>>,
    cseq: Mutex<Option<String>>,
    route_set: Mutex<Vec<ArcStr>>,
    socket: Mutex<Option<SocketAddr>>,
}

impl Leg {
    /// Current tag for this leg, if the dialog has progressed far enough
    /// to have assigned one.
    pub fn tag(&self) -> Option<ArcStr> {
        self.tag.lock().expect("leg lock poisoned").clone()
    }

    /// Sets the tag for this leg.
    pub fn set_tag(&self, tag: ArcStr) {
        *self.tag.lock().expect("leg lock poisoned") = Some(tag);
    }

    /// Current contact URI for this leg.
    pub fn contact(&self) -> Option<ArcStr> {
        self.contact.lock().expect("leg lock poisoned").clone()
    }

    /// Sets the contact URI for this leg.
    pub fn set_contact(&self, contact: ArcStr) {
        *self.contact.lock().expect("leg lock poisoned") = Some(contact);
    }

    /// Last CSeq string seen on this leg (e.g. `"314159 INVITE"`).
    pub fn cseq(&self) -> Option<String> {
        self.cseq.lock().expect("leg lock poisoned").clone()
    }

    /// Records a new CSeq string on this leg.
    pub fn set_cseq(&self, cseq: String) {
        *self.cseq.lock().expect("leg lock poisoned") = Some(cseq);
    }

    /// Snapshot of the ordered route set for this leg.
    pub fn route_set(&self) -> Vec<ArcStr> {
        self.route_set.lock().expect("leg lock poisoned").clone()
    }

    /// Replaces the route set for this leg.
    pub fn set_route_set(&self, route_set: Vec<ArcStr>) {
        *self.route_set.lock().expect("leg lock poisoned") = route_set;
    }

    /// Bound local socket, if any.
    pub fn socket(&self) -> Option<SocketAddr> {
        *self.socket.lock().expect("leg lock poisoned")
    }

    /// Binds a local socket to this leg.
    pub fn set_socket(&self, socket: SocketAddr) {
        *self.socket.lock().expect("leg lock poisoned") = Some(socket);
    }
}

/// Membership of a dialog in a named profile, recorded on the dialog side
/// so `is_in` can answer in O(1) without visiting the profile bucket (spec
/// §4.D / §9 cyclic-reference resolution: the dialog owns the link, the
/// profile only ever stores an [`Iuid`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileLink {
    /// Name of the profile.
    pub profile: ArcStr,
    /// Value keying the membership, for with-value profiles.
    pub value: Option<ArcStr>,
}

struct Inner {
    iuid: Iuid,
    call_id: ArcStr,
    req_uri: ArcStr,
    from_uri: ArcStr,
    to_uri: ArcStr,
    legs: [Leg; 2],
    state: Mutex<DialogState>,
    init_ts: SystemTime,
    start_ts: Mutex<Option<SystemTime>>,
    end_ts: Mutex<Option<SystemTime>>,
    end_reason: Mutex<Option<EndReason>>,
    timeout: AtomicU64,
    lifetime: AtomicU64,
    dflags: AtomicU32,
    sflags: AtomicU32,
    iflags: AtomicU32,
    ka_failures: AtomicU32,
    vars: Mutex<Vec<DialogVar>>,
    profile_links: Mutex<HashSet<ProfileLink>>,
    timer_linked: AtomicBool,
}

/// A live SIP dialog. Cheaply `Clone`-able; every clone is a reference to
/// the same underlying record. The table holds one clone for as long as
/// the dialog is reachable, so `Arc::strong_count` is the idiomatic stand-in
/// for the source's manual reference count (see DESIGN.md).
#[derive(Clone)]
pub struct Dialog(Arc<Inner>);

/// Construction parameters for a new dialog, gathered from the initial
/// dialog-forming request by the caller (the dispatcher) before insertion.
pub struct NewDialog {
    /// Call-ID of the dialog.
    pub call_id: ArcStr,
    /// From-tag (caller leg tag), as copied out of the request.
    pub from_tag: ArcStr,
    /// Request-URI of the initial request.
    pub req_uri: ArcStr,
    /// From-URI of the initial request.
    pub from_uri: ArcStr,
    /// To-URI of the initial request.
    pub to_uri: ArcStr,
    /// Caller contact URI.
    pub caller_contact: ArcStr,
    /// CSeq string on the initial request.
    pub caller_cseq: String,
    /// Lifetime, in seconds, used for the main lifetime timer once confirmed.
    pub lifetime: Duration,
}

impl Dialog {
    /// Builds a fresh, unlinked `Dialog` in the `Unconfirmed` state. The
    /// caller is responsible for inserting it into the table, which assigns
    /// `iuid`.
    pub(crate) fn new(iuid: Iuid, params: NewDialog) -> Dialog {
        let caller = Leg::default();
        caller.set_contact(params.caller_contact);
        caller.set_cseq(params.caller_cseq);
        caller.set_tag(params.from_tag);

        let inner = Inner {
            iuid,
            call_id: params.call_id,
            req_uri: params.req_uri,
            from_uri: params.from_uri,
            to_uri: params.to_uri,
            legs: [caller, Leg::default()],
            state: Mutex::new(DialogState::Unconfirmed),
            init_ts: SystemTime::now(),
            start_ts: Mutex::new(None),
            end_ts: Mutex::new(None),
            end_reason: Mutex::new(None),
            timeout: AtomicU64::new(0),
            lifetime: AtomicU64::new(params.lifetime.as_secs()),
            dflags: AtomicU32::new(dflags::NEW | dflags::DIRTY),
            sflags: AtomicU32::new(0),
            iflags: AtomicU32::new(0),
            ka_failures: AtomicU32::new(0),
            vars: Mutex::new(Vec::new()),
            profile_links: Mutex::new(HashSet::new()),
            timer_linked: AtomicBool::new(false),
        };

        Dialog(Arc::new(inner))
    }

    /// The dialog's internal unique identity.
    pub fn iuid(&self) -> Iuid {
        self.0.iuid
    }

    /// Call-ID of the dialog.
    pub fn call_id(&self) -> &ArcStr {
        &self.0.call_id
    }

    /// Request-URI captured at dialog creation.
    pub fn req_uri(&self) -> &ArcStr {
        &self.0.req_uri
    }

    /// From-URI captured at dialog creation.
    pub fn from_uri(&self) -> &ArcStr {
        &self.0.from_uri
    }

    /// To-URI captured at dialog creation.
    pub fn to_uri(&self) -> &ArcStr {
        &self.0.to_uri
    }

    /// Current From-tag (caller leg tag). Present from creation.
    pub fn from_tag(&self) -> ArcStr {
        self.leg(LEG_CALLER).tag().expect("caller tag set at creation")
    }

    /// Current To-tag (callee leg tag). Empty until the 2xx reply assigns one.
    pub fn to_tag(&self) -> Option<ArcStr> {
        self.leg(LEG_CALLEE).tag()
    }

    /// Borrow one of the two legs (`LEG_CALLER` / `LEG_CALLEE`).
    pub fn leg(&self, leg: usize) -> &Leg {
        &self.0.legs[leg]
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DialogState {
        *self.0.state.lock().expect("state lock poisoned")
    }

    /// `init_ts`: record creation time.
    pub fn init_ts(&self) -> SystemTime {
        self.0.init_ts
    }

    /// `start_ts`: set once the dialog reaches `ConfirmedNoAck`.
    pub fn start_ts(&self) -> Option<SystemTime> {
        *self.0.start_ts.lock().expect("start_ts lock poisoned")
    }

    /// `end_ts`: set once the dialog reaches `Deleted`.
    pub fn end_ts(&self) -> Option<SystemTime> {
        *self.0.end_ts.lock().expect("end_ts lock poisoned")
    }

    /// Reason the dialog ended, once it has.
    pub fn end_reason(&self) -> Option<EndReason> {
        *self.0.end_reason.lock().expect("end_reason lock poisoned")
    }

    /// Configured lifetime, in seconds.
    pub fn lifetime(&self) -> u64 {
        self.0.lifetime.load(Ordering::Relaxed)
    }

    /// Sets the configured lifetime, in seconds.
    pub fn set_lifetime(&self, secs: u64) {
        self.0.lifetime.store(secs, Ordering::Relaxed);
    }

    /// Script-visible flags (`sflags`).
    pub fn sflags(&self) -> u32 {
        self.0.sflags.load(Ordering::Relaxed)
    }

    /// Sets script-visible flags (`sflags`), OR-ing in `bits`.
    pub fn set_sflags(&self, bits: u32) {
        self.0.sflags.fetch_or(bits, Ordering::Relaxed);
    }

    /// Clears script-visible flags (`sflags`).
    pub fn clear_sflags(&self, bits: u32) {
        self.0.sflags.fetch_and(!bits, Ordering::Relaxed);
    }

    /// Internal flags (`iflags`), see the [`iflags`] module.
    pub fn iflags(&self) -> u32 {
        self.0.iflags.load(Ordering::Relaxed)
    }

    /// Sets internal flags, OR-ing in `bits`.
    pub fn set_iflags(&self, bits: u32) {
        self.0.iflags.fetch_or(bits, Ordering::Relaxed);
    }

    /// Clears internal flags.
    pub fn clear_iflags(&self, bits: u32) {
        self.0.iflags.fetch_and(!bits, Ordering::Relaxed);
    }

    /// Persistence dirty bits (`dflags`).
    pub fn dflags(&self) -> u32 {
        self.0.dflags.load(Ordering::Relaxed)
    }

    /// Marks the record dirty so the persistence driver picks it up.
    pub fn mark_dirty(&self) {
        self.0.dflags.fetch_or(dflags::DIRTY, Ordering::Relaxed);
    }

    /// Clears the dirty bits after a successful flush.
    pub fn clear_dirty(&self) {
        self.0
            .dflags
            .fetch_and(!(dflags::DIRTY | dflags::NEW), Ordering::Relaxed);
    }

    /// Overwrites `dflags` outright, for rebuilding a dialog from a
    /// persisted record where the bits must come back exactly as they were
    /// serialized rather than through the `NEW`/`DIRTY` constructor default.
    pub(crate) fn set_dflags_raw(&self, bits: u32) {
        self.0.dflags.store(bits, Ordering::Relaxed);
    }

    /// Forces the lifecycle state directly, bypassing `apply_event`'s
    /// transition table. Only valid when rebuilding a dialog from a
    /// previously persisted record, whose state was itself reached through
    /// validated transitions before it was serialized.
    pub(crate) fn set_state_raw(&self, state: DialogState) {
        *self.0.state.lock().expect("state lock poisoned") = state;
    }

    /// Forces `start_ts` directly, for restoring a persisted record.
    pub(crate) fn set_start_ts_raw(&self, ts: Option<SystemTime>) {
        *self.0.start_ts.lock().expect("start_ts lock poisoned") = ts;
    }

    /// Forces `end_ts` directly, for restoring a persisted record.
    pub(crate) fn set_end_ts_raw(&self, ts: Option<SystemTime>) {
        *self.0.end_ts.lock().expect("end_ts lock poisoned") = ts;
    }

    /// Overwrites the stored end reason directly. `apply_event`'s
    /// `ForcedEnd` arm always stamps `EndReason::ForcedEnd`, but callers of
    /// `force_end` (expiration sweep, keepalive failure, RPC) each mean a
    /// different reason; this lets the caller's actual reason win.
    pub(crate) fn set_end_reason_raw(&self, reason: EndReason) {
        *self.0.end_reason.lock().expect("end_reason lock poisoned") = Some(reason);
    }

    /// Consecutive unanswered keepalive count.
    pub fn ka_failures(&self) -> u32 {
        self.0.ka_failures.load(Ordering::Relaxed)
    }

    /// Increments the keepalive failure count and returns the new value.
    pub fn bump_ka_failures(&self) -> u32 {
        self.0.ka_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Resets the keepalive failure count on a successful reply.
    pub fn reset_ka_failures(&self) {
        self.0.ka_failures.store(0, Ordering::Relaxed);
    }

    /// Whether the dialog currently has a link in the timer ring.
    pub(crate) fn is_timer_linked(&self) -> bool {
        self.0.timer_linked.load(Ordering::Acquire)
    }

    pub(crate) fn set_timer_linked(&self, linked: bool) {
        self.0.timer_linked.store(linked, Ordering::Release);
    }

    /// Access to the variable-store cells.
    pub(crate) fn vars_mut(&self) -> std::sync::MutexGuard<'_, Vec<DialogVar>> {
        self.0.vars.lock().expect("vars lock poisoned")
    }

    /// Access to the set of profile memberships recorded on the dialog.
    pub(crate) fn profile_links_mut(&self) -> std::sync::MutexGuard<'_, HashSet<ProfileLink>> {
        self.0.profile_links.lock().expect("profile_links lock poisoned")
    }

    /// Applies an externally observed event to the state machine, enforcing
    /// monotonicity and performing the actions listed in the transition
    /// table. Returns the new state on success.
    pub fn apply_event(&self, event: DialogEvent) -> Result<DialogState> {
        let mut state = self.0.state.lock().expect("state lock poisoned");
        let from = *state;

        let next = match (from, event) {
            (DialogState::Unconfirmed, DialogEvent::Provisional) => DialogState::Early,
            (DialogState::Unconfirmed | DialogState::Early, DialogEvent::FinalOk) => {
                *self.0.start_ts.lock().expect("start_ts lock poisoned") = Some(SystemTime::now());
                DialogState::ConfirmedNoAck
            }
            (DialogState::ConfirmedNoAck, DialogEvent::Ack) => DialogState::Confirmed,
            (DialogState::Unconfirmed | DialogState::Early, DialogEvent::FinalFailure) => {
                self.finish(&mut state, EndReason::Rejected);
                DialogState::Deleted
            }
            (DialogState::ConfirmedNoAck | DialogState::Confirmed, DialogEvent::Bye) => {
                self.finish(&mut state, EndReason::Bye);
                DialogState::Deleted
            }
            (current, DialogEvent::TimerExpiry) if current != DialogState::Deleted => {
                self.finish(&mut state, EndReason::Expired);
                DialogState::Deleted
            }
            (current, DialogEvent::ForcedEnd) if current != DialogState::Deleted => {
                self.finish(&mut state, EndReason::ForcedEnd);
                DialogState::Deleted
            }
            (DialogState::Confirmed, DialogEvent::InDialogRequest) => DialogState::Confirmed,
            (from, event) => {
                return Err(crate::Error::Conflict { from, event: event.name() });
            }
        };

        *state = next;
        self.mark_dirty();
        Ok(next)
    }

    fn finish(&self, state: &mut DialogState, reason: EndReason) {
        let _ = state;
        *self.0.end_ts.lock().expect("end_ts lock poisoned") = Some(SystemTime::now());
        *self.0.end_reason.lock().expect("end_reason lock poisoned") = Some(reason);
    }

    /// Whether the in-dialog lifetime timer should be rearmed on traffic,
    /// i.e. `timeout-noreset` is not set.
    pub fn reset_timeout_on_traffic(&self) -> bool {
        self.iflags() & iflags::TIMEOUT_NORESET == 0
    }
}

impl fmt::Debug for Dialog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialog")
            .field("iuid", &self.iuid())
            .field("call_id", &self.call_id().as_ref())
            .field("state", &self.state())
            .finish()
    }
}
