//! Walks a single call through the dialog core end to end, using a
//! logging-only stand-in for the transaction engine. Run with
//! `cargo run --example inprocess_call -p demos`.

use std::sync::Arc;

use dialog_core::config::Config;
use dialog_core::dialog::Dialog;
use dialog_core::dispatch::InitialRequest;
use dialog_core::engine::DialogEngine;
use dialog_core::external::TransactionEngine;
use dialog_core::Result;

struct LoggingTransactionEngine;

#[async_trait::async_trait]
impl TransactionEngine for LoggingTransactionEngine {
    async fn send_request_within(
        &self,
        dialog: &Dialog,
        leg: usize,
        method: &str,
        _extra_headers: Option<&str>,
        _content_type: Option<&str>,
        _body: Option<&[u8]>,
    ) -> Result<()> {
        tracing::info!(iuid = %dialog.iuid(), leg, method, "would send request within dialog");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::builder().profile_no_value("active").build().expect("valid config");
    let engine = DialogEngine::new(config, Arc::new(LoggingTransactionEngine));

    let dialog = engine.on_initial_request(InitialRequest {
        call_id: "demo-call-1".into(),
        from_tag: "alice-tag".into(),
        req_uri: "sip:bob@biloxi.example.com".into(),
        from_uri: "sip:alice@atlanta.example.com".into(),
        to_uri: "sip:bob@biloxi.example.com".into(),
        caller_contact: "sip:alice@client.atlanta.example.com".into(),
        caller_cseq: "1 INVITE".into(),
    });
    engine.profiles().set("active", &dialog, None).expect("profile declared");

    engine.on_provisional_reply(&dialog, None).expect("early reply");
    engine
        .on_final_reply(&dialog, 200, Some("bob-tag".into()))
        .expect("final reply");
    engine.on_ack(&dialog).expect("ack");

    tracing::info!(state = %dialog.state(), "call established");
    for summary in engine.rpc_list() {
        tracing::info!(iuid = summary.iuid, state = %summary.state, "active dialog");
    }

    engine
        .rpc_terminate("demo-call-1", "alice-tag", "bob-tag")
        .expect("terminate");
    tracing::info!(state = %dialog.state(), "call ended");

    engine.shutdown().await;
}
