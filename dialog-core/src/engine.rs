//! The process-wide dialog core singleton: owns the table, timer ring,
//! profile index and the handles to the external collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::callback::CallbackRegistry;
use crate::config::{Config, DbMode};
use crate::dialog::Dialog;
use crate::external::{
    DefaultRoutingEngine, NoopReplicationSink, PersistenceDriver, ReplicationSink, RoutingEngine, TransactionEngine,
};
use crate::profile::{ProfileIndex, ProfileKind};
use crate::table::DialogTable;
use crate::timer::TimerRing;

/// Running totals maintained at transition time, backing the RPC "active
/// call statistics" query.
#[derive(Default)]
pub struct ActiveCounters {
    created: AtomicU64,
    confirmed: AtomicU64,
}

impl ActiveCounters {
    pub(crate) fn bump_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_confirmed(&self) {
        self.confirmed.fetch_add(1, Ordering::Relaxed);
    }

    /// Total dialogs created since startup.
    pub fn created_total(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Total dialogs that reached `Confirmed` since startup.
    pub fn confirmed_total(&self) -> u64 {
        self.confirmed.load(Ordering::Relaxed)
    }
}

/// The dialog core, holding every live dialog plus the indices over them.
/// Cheap to share as `Arc<DialogEngine>` across the maintenance tasks and
/// whatever drives `dispatch.rs` from the transaction engine's callbacks.
pub struct DialogEngine {
    pub(crate) config: Config,
    pub(crate) table: DialogTable,
    pub(crate) timer: TimerRing,
    pub(crate) profiles: ProfileIndex,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) active_counters: ActiveCounters,
    pub(crate) transaction: Arc<dyn TransactionEngine>,
    pub(crate) routing: Arc<dyn RoutingEngine>,
    pub(crate) persistence: Option<Arc<dyn PersistenceDriver>>,
    pub(crate) replication: Arc<dyn ReplicationSink>,
    realtime_tx: Option<mpsc::UnboundedSender<Dialog>>,
    realtime_rx: Mutex<Option<mpsc::UnboundedReceiver<Dialog>>>,
}

impl DialogEngine {
    /// Builds an engine from a validated [`Config`] and the mandatory
    /// transaction-engine handle. Declares every profile named in `config`.
    /// Use the `with_*` methods to attach the optional collaborators before
    /// the engine is shared.
    pub fn new(config: Config, transaction: Arc<dyn TransactionEngine>) -> Self {
        let mut profiles = ProfileIndex::new();
        for decl in config.profile_decls() {
            profiles.declare(decl.name, decl.kind);
        }

        let (realtime_tx, realtime_rx) = if config.db_mode == DbMode::Realtime {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Mutex::new(Some(rx)))
        } else {
            (None, Mutex::new(None))
        };

        DialogEngine {
            table: DialogTable::new(config.hash_size, config.id_start, config.id_step),
            timer: TimerRing::new(),
            profiles,
            callbacks: CallbackRegistry::new(),
            active_counters: ActiveCounters::default(),
            transaction,
            routing: Arc::new(DefaultRoutingEngine),
            persistence: None,
            replication: Arc::new(NoopReplicationSink),
            realtime_tx,
            realtime_rx,
            config,
        }
    }

    /// Attaches a non-default [`RoutingEngine`].
    pub fn with_routing(mut self, routing: Arc<dyn RoutingEngine>) -> Self {
        self.routing = routing;
        self
    }

    /// Attaches a [`PersistenceDriver`], enabling the DB-flush maintenance
    /// task when `config.db_mode != DbMode::None`.
    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceDriver>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Attaches a [`ReplicationSink`].
    pub fn with_replication(mut self, replication: Arc<dyn ReplicationSink>) -> Self {
        self.replication = replication;
        self
    }

    /// Declares a profile after construction (e.g. loaded from a management
    /// interface rather than static configuration). Declaring the same name
    /// twice replaces the existing (necessarily empty, since nothing could
    /// have joined it) profile.
    pub fn declare_profile(&mut self, name: impl Into<dialog_util::ArcStr>, kind: ProfileKind) {
        self.profiles.declare(name, kind);
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The dialog table.
    pub fn table(&self) -> &DialogTable {
        &self.table
    }

    /// The timer ring.
    pub fn timer(&self) -> &TimerRing {
        &self.timer
    }

    /// The profile index.
    pub fn profiles(&self) -> &ProfileIndex {
        &self.profiles
    }

    /// The callback registry, for registering handlers.
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// Running creation/confirmation totals.
    pub fn active_counters(&self) -> &ActiveCounters {
        &self.active_counters
    }

    /// The transaction-engine handle, for issuing requests within a dialog.
    pub fn transaction(&self) -> &Arc<dyn TransactionEngine> {
        &self.transaction
    }

    /// The persistence driver, if configured.
    pub fn persistence(&self) -> Option<&Arc<dyn PersistenceDriver>> {
        self.persistence.as_ref()
    }

    /// Queues `dialog` for a write-through persistence flush when
    /// `db_mode == Realtime`. A no-op in every other mode. Dispatch call
    /// sites invoke this after every state-mutating event; the enqueue is a
    /// non-blocking channel send so the caller never waits on I/O, and the
    /// actual `store`/`update` call happens on the task spawned by
    /// [`crate::maintenance::spawn_realtime_persist`].
    pub(crate) fn notify_dirty(&self, dialog: &Dialog) {
        if let Some(tx) = &self.realtime_tx {
            let _ = tx.send(dialog.clone());
        }
    }

    /// Takes the realtime-persistence receiver, if `db_mode == Realtime` and
    /// nothing has taken it yet. Called once by
    /// [`crate::maintenance::spawn_realtime_persist`] to hand the queue to
    /// its flush task.
    pub(crate) fn take_realtime_receiver(&self) -> Option<mpsc::UnboundedReceiver<Dialog>> {
        self.realtime_rx.lock().unwrap().take()
    }

    /// Flushes every dirty dialog through the persistence driver, if one is
    /// configured, and drops every dialog handle the engine itself holds.
    /// Called on graceful shutdown, matching the "flush dirty dialogs on
    /// stop" design note.
    pub async fn shutdown(&self) {
        if let Some(driver) = &self.persistence {
            let mut dirty = Vec::new();
            self.table.for_each(|dialog| {
                if dialog.dflags() & crate::dialog::dflags::DIRTY != 0 {
                    dirty.push(dialog.clone());
                }
            });
            for dialog in dirty {
                let record = crate::persist::snapshot(&dialog);
                let result = if dialog.dflags() & crate::dialog::dflags::NEW != 0 {
                    driver.store(&record).await
                } else {
                    driver.update(&record).await
                };
                match result {
                    Ok(()) => dialog.clear_dirty(),
                    Err(err) => log::warn!("shutdown flush failed for dialog {}: {err}", dialog.iuid()),
                }
            }
        }
        log::info!("dialog engine shutdown: {} dialogs were live", self.table.len());
    }
}
