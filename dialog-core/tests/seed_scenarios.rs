//! End-to-end coverage for the seed scenarios named in the component
//! design: a full call, a rejection, a missing ACK, a keepalive failure,
//! concurrent profile membership, and spiral suppression. Unlike the
//! per-module unit tests, these drive the public API the way a caller
//! embedding this crate into a proxy would, across several modules at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dialog_core::config::Config;
use dialog_core::dialog::Dialog;
use dialog_core::dispatch::InitialRequest;
use dialog_core::engine::DialogEngine;
use dialog_core::external::{RoutingEngine, TransactionEngine};
use dialog_core::maintenance::spawn_expiration_sweep;
use dialog_core::state::{DialogState, EndReason};
use dialog_core::Result;

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

fn initial(call_id: &str) -> InitialRequest {
    InitialRequest {
        call_id: call_id.into(),
        from_tag: "a".into(),
        req_uri: "sip:bob@biloxi.example.com".into(),
        from_uri: "sip:alice@atlanta.example.com".into(),
        to_uri: "sip:bob@biloxi.example.com".into(),
        caller_contact: "sip:alice@client.atlanta.example.com".into(),
        caller_cseq: "1 INVITE".into(),
    }
}

/// Scenario 1: INVITE -> 180 -> 200 (to-tag) -> ACK -> BYE.
#[test]
fn happy_call_walks_the_full_state_path_and_releases_the_reference() {
    let engine = DialogEngine::new(Config::builder().build().unwrap(), Arc::new(NoopTransactionEngine));

    let dialog = engine.on_initial_request(initial("c1"));
    assert_eq!(dialog.state(), DialogState::Unconfirmed);

    engine.on_provisional_reply(&dialog, None).unwrap();
    assert_eq!(dialog.state(), DialogState::Early);

    engine.on_final_reply(&dialog, 200, Some("b".into())).unwrap();
    assert_eq!(dialog.state(), DialogState::ConfirmedNoAck);
    assert!(dialog.start_ts().is_some());

    engine.on_ack(&dialog).unwrap();
    assert_eq!(dialog.state(), DialogState::Confirmed);

    engine.on_in_dialog_request(&dialog, "BYE", "2 BYE".into(), dialog_core::callback::LegDirection::Caller).unwrap();
    assert_eq!(dialog.state(), DialogState::Deleted);
    assert!(dialog.end_ts().is_some());
    assert_eq!(dialog.end_reason(), Some(EndReason::Bye));

    // Unlinked from the table; the only reference left is this local handle.
    assert!(engine.table().lookup_by_iuid(dialog.iuid()).is_none());
}

/// Scenario 2: INVITE -> 486.
#[test]
fn rejected_call_never_sets_start_ts() {
    let engine = DialogEngine::new(Config::builder().build().unwrap(), Arc::new(NoopTransactionEngine));

    let dialog = engine.on_initial_request(initial("c2"));
    engine.on_final_reply(&dialog, 486, None).unwrap();

    assert_eq!(dialog.state(), DialogState::Deleted);
    assert_eq!(dialog.end_reason(), Some(EndReason::Rejected));
    assert!(dialog.start_ts().is_none());
    assert!(engine.table().lookup_by_iuid(dialog.iuid()).is_none());
}

/// Scenario 3: INVITE -> 200 -> no ACK within `noack_timeout`.
#[tokio::test(start_paused = true)]
async fn missing_ack_expires_after_noack_timeout() {
    let config = Config::builder().noack_timeout(2).build().unwrap();
    let engine = Arc::new(DialogEngine::new(config, Arc::new(NoopTransactionEngine)));

    let dialog = engine.on_initial_request(initial("c3"));
    engine.on_provisional_reply(&dialog, None).unwrap();
    engine.on_final_reply(&dialog, 200, Some("b".into())).unwrap();
    assert_eq!(dialog.state(), DialogState::ConfirmedNoAck);

    let _sweep = spawn_expiration_sweep(engine.clone());
    tokio::time::advance(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;

    assert_eq!(dialog.state(), DialogState::Deleted);
    assert_eq!(dialog.end_reason(), Some(EndReason::Expired));
}

/// Scenario 4: confirmed dialog with `ka-dst`, `ka-failed-limit=2`; two
/// consecutive unanswered OPTIONS force it to `Deleted`.
#[tokio::test(start_paused = true)]
async fn keepalive_failures_past_the_limit_end_the_dialog() {
    struct AlwaysFailTransactionEngine;

    #[async_trait::async_trait]
    impl TransactionEngine for AlwaysFailTransactionEngine {
        async fn send_request_within(
            &self,
            _dialog: &Dialog,
            _leg: usize,
            _method: &str,
            _extra_headers: Option<&str>,
            _content_type: Option<&str>,
            _body: Option<&[u8]>,
        ) -> Result<()> {
            Err(dialog_core::Error::DownstreamFailed("no reply".into()))
        }
    }

    let config = Config::builder()
        .keepalive_interval(30)
        .keepalive_failed_limit(2)
        .build()
        .unwrap();
    let engine = Arc::new(DialogEngine::new(config, Arc::new(AlwaysFailTransactionEngine)));

    let dialog = engine.on_initial_request(initial("c4"));
    engine.on_provisional_reply(&dialog, None).unwrap();
    engine.on_final_reply(&dialog, 200, Some("b".into())).unwrap();
    engine.on_ack(&dialog).unwrap();
    dialog.set_iflags(dialog_core::dialog::iflags::KA_DST);

    let _ka = dialog_core::maintenance::spawn_keepalive_loop(engine.clone()).expect("keepalive enabled");

    tokio::time::advance(Duration::from_secs(30)).await;
    tokio::task::yield_now().await;
    assert_eq!(dialog.state(), DialogState::Confirmed);

    tokio::time::advance(Duration::from_secs(30)).await;
    tokio::task::yield_now().await;
    assert_eq!(dialog.state(), DialogState::Deleted);
    assert_eq!(dialog.end_reason(), Some(EndReason::KeepaliveFailed));
}

/// Scenario 5: N workers each set/unset the same dialog into a no-value
/// profile; the membership count tracks every concurrent writer.
#[test]
fn profile_size_is_exact_under_concurrent_writers() {
    let engine = Arc::new(DialogEngine::new(
        Config::builder().profile_no_value("active").build().unwrap(),
        Arc::new(NoopTransactionEngine),
    ));

    const N: usize = 16;
    let dialogs: Vec<Dialog> = (0..N).map(|i| engine.on_initial_request(initial(&format!("call-{i}")))).collect();

    let set_count = Arc::new(AtomicUsize::new(0));
    std::thread::scope(|scope| {
        for dialog in &dialogs {
            let engine = engine.clone();
            let set_count = set_count.clone();
            scope.spawn(move || {
                engine.profiles().set("active", dialog, None).unwrap();
                set_count.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    assert_eq!(set_count.load(Ordering::SeqCst), N);
    assert_eq!(engine.profiles().size("active", None).unwrap(), N);

    std::thread::scope(|scope| {
        for dialog in &dialogs {
            let engine = engine.clone();
            scope.spawn(move || {
                engine.profiles().unset("active", dialog, None).unwrap();
            });
        }
    });

    assert_eq!(engine.profiles().size("active", None).unwrap(), 0);
}

/// Scenario 6: an in-dialog request carrying this module's own Record-Route
/// IUID parameter a second time is recognized as a spiral and matched back
/// to the existing dialog rather than treated as a fresh one.
#[test]
fn spiral_request_is_located_instead_of_duplicated() {
    let engine = DialogEngine::new(
        Config::builder().detect_spirals(true).build().unwrap(),
        Arc::new(NoopTransactionEngine),
    );

    let dialog = engine.on_initial_request(initial("c6"));
    engine.on_final_reply(&dialog, 200, Some("b".into())).unwrap();
    engine.on_ack(&dialog).unwrap();

    let rr_param = dialog_core::external::DefaultRoutingEngine.encode_iuid(dialog.iuid());

    let routed = dialog_core::dispatch::RoutedRequest {
        call_id: "c6".into(),
        from_tag: "a".into(),
        to_tag: "b".into(),
        method: "INFO".into(),
        rr_param: Some(rr_param.clone()),
    };

    let (first_match, _) = engine.route_in_dialog(&routed).expect("matched by rr param");
    assert_eq!(first_match.iuid(), dialog.iuid());

    // Re-entering with the same Record-Route parameter is the spiral: same
    // dialog located again, no second dialog created anywhere in the table.
    let (second_match, _) = engine.route_in_dialog(&routed).expect("matched again on spiral");
    assert_eq!(second_match.iuid(), dialog.iuid());
    assert_eq!(engine.table().len(), 1);
}
