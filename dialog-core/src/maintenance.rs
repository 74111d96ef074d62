//! Periodic background work: the main expiration sweep,
//! the keepalive loop, the stale/early cleanup sweep, and the DB-flush
//! driver. Each runs as its own `tokio::spawn`'d task on a
//! `tokio::time::interval`, except the realtime persistence flush, which is
//! driven by a channel instead of a tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::DbMode;
use crate::dialog::{dflags, Dialog};
use crate::engine::DialogEngine;
use crate::state::{DialogState, EndReason};

/// Ticks the timer ring once a second, advancing every due dialog through
/// `TimerExpiry` and firing the `expired` callback.
pub fn spawn_expiration_sweep(engine: Arc<DialogEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let expired = engine.timer.extract_expired(Instant::now());
            for dialog in expired {
                if dialog.state() == DialogState::Deleted {
                    continue;
                }
                if let Err(err) = engine.force_end(&dialog, EndReason::Expired) {
                    log::warn!("failed to expire dialog {}: {err}", dialog.iuid());
                }
            }
        }
    })
}

/// Issues a keepalive `OPTIONS` on every `Confirmed` dialog with
/// `iflags::KA_SRC`/`KA_DST` set, at `config.keepalive_interval`. A dialog
/// whose `keepalive_failed_limit` is exceeded is force-ended with
/// [`EndReason::KeepaliveFailed`]. Returns `None` if keepalive is disabled
/// (`keepalive_interval == 0`), matching the module parameter's semantics.
pub fn spawn_keepalive_loop(engine: Arc<DialogEngine>) -> Option<JoinHandle<()>> {
    let period = engine.config().keepalive_interval;
    if period.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let mut candidates = Vec::new();
            engine.table.for_each(|dialog| {
                if dialog.state() == DialogState::Confirmed {
                    candidates.push(dialog.clone());
                }
            });

            for dialog in candidates {
                send_keepalive(&engine, &dialog).await;
            }
        }
    }))
}

async fn send_keepalive(engine: &DialogEngine, dialog: &Dialog) {
    use crate::dialog::{iflags, LEG_CALLEE, LEG_CALLER};

    let legs = [
        (iflags::KA_SRC, LEG_CALLER),
        (iflags::KA_DST, LEG_CALLEE),
    ];

    for (flag, leg) in legs {
        if dialog.iflags() & flag == 0 {
            continue;
        }
        let outcome = engine
            .transaction
            .send_request_within(dialog, leg, "OPTIONS", None, None, None)
            .await;

        match outcome {
            Ok(()) => dialog.reset_ka_failures(),
            Err(err) => {
                let failures = dialog.bump_ka_failures();
                log::debug!("keepalive failed on dialog {} leg {leg}: {err}", dialog.iuid());
                if failures >= engine.config().keepalive_failed_limit {
                    if let Err(err) = engine.force_end(dialog, EndReason::KeepaliveFailed) {
                        log::warn!("failed to end keepalive-dead dialog {}: {err}", dialog.iuid());
                    }
                }
            }
        }
    }
}

/// Sweeps `Unconfirmed`/`Early` dialogs stuck past `early_timeout` (a
/// defensive backstop alongside the timer ring) and reaps expired
/// [`crate::profile::RemoteProfile`] entries, at `config.db_update_period`
/// cadence.
pub fn spawn_cleanup_sweep(engine: Arc<DialogEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = engine.config().db_update_period.max(Duration::from_secs(1));
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let mut stale = Vec::new();
            engine.table.for_each(|dialog| {
                let stuck = matches!(dialog.state(), DialogState::Unconfirmed | DialogState::Early)
                    && !dialog.is_timer_linked();
                if stuck {
                    stale.push(dialog.clone());
                }
            });

            for dialog in stale {
                log::warn!("reaping dialog {} stuck in {} with no timer linked", dialog.iuid(), dialog.state());
                if let Err(err) = engine.force_end(&dialog, EndReason::Expired) {
                    log::warn!("failed to reap stale dialog {}: {err}", dialog.iuid());
                }
            }
        }
    })
}

/// Drives the persistence backend according to `config.db_mode`: `Realtime`
/// mode is served by [`spawn_realtime_persist`] instead of a tick, `Shutdown`
/// mode needs no periodic task (writes happen once at shutdown via
/// [`DialogEngine::shutdown`]), and `Delayed` mode flushes every dirty
/// dialog on `db_update_period`. Returns `None` when no persistence driver
/// is configured or `db_mode` needs no task.
pub fn spawn_db_flush(engine: Arc<DialogEngine>) -> Option<JoinHandle<()>> {
    if engine.config().db_mode != DbMode::Delayed {
        return None;
    }
    let driver = engine.persistence()?.clone();

    Some(tokio::spawn(async move {
        let mut ticker = interval(engine.config().db_update_period);
        loop {
            ticker.tick().await;
            let mut dirty = Vec::new();
            engine.table.for_each(|dialog| {
                if dialog.dflags() & dflags::DIRTY != 0 {
                    dirty.push(dialog.clone());
                }
            });

            for dialog in dirty {
                let record = crate::persist::snapshot(&dialog);
                let is_new = dialog.dflags() & dflags::NEW != 0;
                let result = if is_new { driver.store(&record).await } else { driver.update(&record).await };
                match result {
                    Ok(()) => dialog.clear_dirty(),
                    Err(err) => log::warn!("delayed flush failed for dialog {}: {err}", dialog.iuid()),
                }
            }
        }
    }))
}

/// Drains the realtime-persistence queue fed by [`DialogEngine::notify_dirty`]:
/// every state-mutating dispatch call enqueues the dialog it touched, and
/// this task flushes it to the persistence driver as soon as it is
/// scheduled, giving `DbMode::Realtime` its "write-through on every change"
/// behavior without the dispatch call site itself blocking on I/O. Returns
/// `None` when `db_mode != Realtime`, no persistence driver is configured,
/// or the receiver has already been taken by an earlier call.
pub fn spawn_realtime_persist(engine: Arc<DialogEngine>) -> Option<JoinHandle<()>> {
    if engine.config().db_mode != DbMode::Realtime {
        return None;
    }
    let driver = engine.persistence()?.clone();
    let mut rx = engine.take_realtime_receiver()?;

    Some(tokio::spawn(async move {
        while let Some(dialog) = rx.recv().await {
            let record = crate::persist::snapshot(&dialog);
            let is_new = dialog.dflags() & dflags::NEW != 0;
            let result = if is_new { driver.store(&record).await } else { driver.update(&record).await };
            match result {
                Ok(()) => dialog.clear_dirty(),
                Err(err) => log::warn!("realtime flush failed for dialog {}: {err}", dialog.iuid()),
            }
        }
    }))
}

/// Loads every dialog the persistence driver knows about, without linking
/// them back into the table (the `dbload` callback fires per record
/// so a caller can decide whether/how to relink). Used on process startup
/// when `config.db_mode != DbMode::None`.
pub async fn load_persisted(engine: &DialogEngine) -> crate::Result<Vec<Dialog>> {
    let Some(driver) = engine.persistence() else {
        return Ok(Vec::new());
    };

    let records = driver.load_all().await?;
    let mut dialogs = Vec::with_capacity(records.len());
    for record in &records {
        let dialog = crate::persist::restore(record);
        engine.callbacks.dispatch(&crate::callback::CallbackEvent {
            dialog: &dialog,
            kind: crate::callback::event_mask::DBLOAD,
            end_reason: None,
            leg: crate::callback::LegDirection::None,
        });
        dialogs.push(dialog);
    }
    Ok(dialogs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::external::TransactionEngine;
    use crate::Result;
    use std::time::Duration as StdDuration;

    struct NoopTransactionEngine;

    #[async_trait::async_trait]
    impl TransactionEngine for NoopTransactionEngine {
        async fn send_request_within(
            &self,
            _dialog: &Dialog,
            _leg: usize,
            _method: &str,
            _extra_headers: Option<&str>,
            _content_type: Option<&str>,
            _body: Option<&[u8]>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_sweep_deletes_due_dialogs() {
        let config = Config::builder().early_timeout(0).build().unwrap();
        let engine = Arc::new(DialogEngine::new(config, Arc::new(NoopTransactionEngine)));

        let dialog = engine.on_initial_request(crate::dispatch::InitialRequest {
            call_id: "c1".into(),
            from_tag: "a".into(),
            req_uri: "sip:bob@biloxi.example.com".into(),
            from_uri: "sip:alice@atlanta.example.com".into(),
            to_uri: "sip:bob@biloxi.example.com".into(),
            caller_contact: "sip:alice@client.atlanta.example.com".into(),
            caller_cseq: "1 INVITE".into(),
        });

        let _handle = spawn_expiration_sweep(engine.clone());
        tokio::time::advance(StdDuration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert_eq!(dialog.state(), DialogState::Deleted);
    }

    #[test]
    fn keepalive_loop_is_none_when_disabled() {
        let engine = Arc::new(DialogEngine::new(Config::builder().build().unwrap(), Arc::new(NoopTransactionEngine)));
        assert!(spawn_keepalive_loop(engine).is_none());
    }

    struct FailingTransactionEngine;

    #[async_trait::async_trait]
    impl TransactionEngine for FailingTransactionEngine {
        async fn send_request_within(
            &self,
            _dialog: &Dialog,
            _leg: usize,
            _method: &str,
            _extra_headers: Option<&str>,
            _content_type: Option<&str>,
            _body: Option<&[u8]>,
        ) -> Result<()> {
            Err(crate::Error::DownstreamFailed("no reply".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_failures_past_limit_force_end_the_dialog() {
        let config = Config::builder()
            .keepalive_interval(30)
            .keepalive_failed_limit(2)
            .build()
            .unwrap();
        let engine = Arc::new(DialogEngine::new(config, Arc::new(FailingTransactionEngine)));

        let dialog = engine.on_initial_request(crate::dispatch::InitialRequest {
            call_id: "c1".into(),
            from_tag: "a".into(),
            req_uri: "sip:bob@biloxi.example.com".into(),
            from_uri: "sip:alice@atlanta.example.com".into(),
            to_uri: "sip:bob@biloxi.example.com".into(),
            caller_contact: "sip:alice@client.atlanta.example.com".into(),
            caller_cseq: "1 INVITE".into(),
        });
        engine.on_provisional_reply(&dialog, None).unwrap();
        engine.on_final_reply(&dialog, 200, Some("b".into())).unwrap();
        engine.on_ack(&dialog).unwrap();
        dialog.set_iflags(crate::dialog::iflags::KA_DST);
        assert_eq!(dialog.state(), DialogState::Confirmed);

        let _handle = spawn_keepalive_loop(engine.clone()).expect("keepalive enabled");
        // Two ticks, two unanswered OPTIONS: the failure limit is reached on
        // the second and the dialog is force-ended with `KeepaliveFailed`.
        tokio::time::advance(StdDuration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(dialog.state(), DialogState::Confirmed);

        tokio::time::advance(StdDuration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(dialog.state(), DialogState::Deleted);
        assert_eq!(dialog.end_reason(), Some(EndReason::KeepaliveFailed));
    }

    #[derive(Default)]
    struct MemoryPersistenceDriver {
        stored: std::sync::Mutex<Vec<crate::persist::PersistedDialog>>,
    }

    #[async_trait::async_trait]
    impl crate::external::PersistenceDriver for MemoryPersistenceDriver {
        async fn load_all(&self) -> Result<Vec<crate::persist::PersistedDialog>> {
            Ok(self.stored.lock().unwrap().clone())
        }

        async fn store(&self, record: &crate::persist::PersistedDialog) -> Result<()> {
            self.stored.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn update(&self, _record: &crate::persist::PersistedDialog) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _iuid: crate::dialog::Iuid) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn realtime_mode_flushes_on_creation_without_waiting_for_a_tick() {
        let config = Config::builder().db_mode(DbMode::Realtime).build().unwrap();
        let driver = Arc::new(MemoryPersistenceDriver::default());
        let engine = Arc::new(
            DialogEngine::new(config, Arc::new(NoopTransactionEngine)).with_persistence(driver.clone()),
        );

        let _handle = spawn_realtime_persist(engine.clone()).expect("realtime mode enabled");
        engine.on_initial_request(crate::dispatch::InitialRequest {
            call_id: "c1".into(),
            from_tag: "a".into(),
            req_uri: "sip:bob@biloxi.example.com".into(),
            from_uri: "sip:alice@atlanta.example.com".into(),
            to_uri: "sip:bob@biloxi.example.com".into(),
            caller_contact: "sip:alice@client.atlanta.example.com".into(),
            caller_cseq: "1 INVITE".into(),
        });

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(driver.stored.lock().unwrap().len(), 1);
    }

    #[test]
    fn realtime_persist_is_none_outside_realtime_mode() {
        let engine = Arc::new(DialogEngine::new(Config::builder().build().unwrap(), Arc::new(NoopTransactionEngine)));
        assert!(spawn_realtime_persist(engine).is_none());
    }
}
