//! Contracts with the collaborators this crate treats as external (spec
//! §1/§6): the transaction engine, the routing engine, and the persistence
//! backend. None of these are implemented here — only their interfaces.

use dialog_util::ArcStr;

use crate::dialog::{Dialog, Iuid};
use crate::persist::PersistedDialog;
use crate::state::DialogState;
use crate::Result;

/// The SIP transaction layer, referred to throughout as the *transaction
/// engine*. It owns message parsing, retransmission and transport; the
/// dialog core only ever asks it to issue in-dialog requests on a leg.
#[async_trait::async_trait]
pub trait TransactionEngine: Send + Sync + 'static {
    /// Issues `method` within `dialog` on behalf of `leg`
    /// ([`crate::dialog::LEG_CALLER`] / [`crate::dialog::LEG_CALLEE`]),
    /// e.g. `BYE`, `REFER`, `OPTIONS`, or an arbitrary in-dialog request.
    /// The resulting transaction's replies are expected to be fed back
    /// through the dispatcher's `on_reply`.
    async fn send_request_within(
        &self,
        dialog: &Dialog,
        leg: usize,
        method: &str,
        extra_headers: Option<&str>,
        content_type: Option<&str>,
        body: Option<&[u8]>,
    ) -> Result<()>;
}

/// The Record-Route / routing module. The dialog core inserts a parameter
/// carrying its IUID so in-dialog traffic can be matched back to a dialog
/// without a tag-based scan; the routing engine strips/presents it.
pub trait RoutingEngine: Send + Sync + 'static {
    /// Renders the Record-Route parameter value carrying `iuid`, using the
    /// configured parameter name (`rr_param`).
    fn encode_iuid(&self, iuid: Iuid) -> String {
        format!("{}:{}", iuid.hash_entry, iuid.hash_id)
    }

    /// Parses an IUID back out of a Record-Route parameter value produced
    /// by [`RoutingEngine::encode_iuid`]. Returns `None` if the value isn't
    /// one of ours (e.g. inserted by a different proxy instance).
    fn decode_iuid(&self, value: &str) -> Option<Iuid> {
        let (entry, id) = value.split_once(':')?;
        Some(Iuid {
            hash_entry: entry.parse().ok()?,
            hash_id: id.parse().ok()?,
        })
    }
}

/// Default [`RoutingEngine`] implementing the encode/decode scheme
/// documented on the trait's default methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRoutingEngine;

impl RoutingEngine for DefaultRoutingEngine {}

/// The database persistence backend. Invoked by the
/// maintenance loops' DB-flush driver, never directly by request handling.
#[async_trait::async_trait]
pub trait PersistenceDriver: Send + Sync + 'static {
    /// Loads every persisted dialog at startup.
    async fn load_all(&self) -> Result<Vec<PersistedDialog>>;

    /// Persists a brand-new dialog.
    async fn store(&self, record: &PersistedDialog) -> Result<()>;

    /// Updates an already-persisted dialog.
    async fn update(&self, record: &PersistedDialog) -> Result<()>;

    /// Removes a persisted dialog by its internal identity.
    async fn remove(&self, iuid: Iuid) -> Result<()>;
}

/// Extension point for cluster replication (`DMQ`), explicitly out of
/// scope. The state machine calls this unconditionally on every
/// transition, the same way the source calls `dlg_dmq_replicate`
/// unconditionally and no-ops when DMQ support is compiled out; the default
/// implementation is a no-op so a replication module can be layered on
/// later without touching the transition call sites.
pub trait ReplicationSink: Send + Sync + 'static {
    /// Called after `dialog` transitions to `new_state`.
    fn on_state_change(&self, dialog: &Dialog, new_state: DialogState) {
        let _ = (dialog, new_state);
    }
}

/// A [`ReplicationSink`] that does nothing, used when no replication module
/// is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReplicationSink;

impl ReplicationSink for NoopReplicationSink {}

/// Result of a field-match RPC query, naming the
/// field compared and its textual value for display purposes.
#[derive(Debug, Clone)]
pub struct FieldMatch {
    /// Name of the matched field.
    pub field: ArcStr,
    /// Operator applied.
    pub op: MatchOp,
    /// Textual representation of the value compared against.
    pub value: String,
}

/// Operators supported by the RPC "match by field" query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    /// Exact equality.
    Eq,
    /// POSIX regular expression match.
    Re,
    /// Starts-with.
    Sw,
    /// Numeric greater-than, applied to `start_ts`.
    Gt,
    /// Numeric less-than, applied to `start_ts`.
    Lt,
}
