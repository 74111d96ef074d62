//! The callback surface: per-dialog or per-module handlers keyed
//! by an event mask, invoked synchronously from the state machine.

use std::sync::{Arc, Mutex};

use crate::dialog::Dialog;
use crate::state::EndReason;

/// Which leg a callback's triggering message is associated with, or
/// neither for events with no message (e.g. `expired`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegDirection {
    /// The caller leg.
    Caller,
    /// The callee leg.
    Callee,
    /// Not associated with either leg.
    None,
}

/// Bitmask of callback event kinds:
/// `created, early, confirmed, failed, ended, expired, request-within,
/// reply-within, dbload, rpc-context`.
pub mod event_mask {
    /// Dialog created (initial request observed).
    pub const CREATED: u32 = 1 << 0;
    /// Dialog reached `Early`.
    pub const EARLY: u32 = 1 << 1;
    /// Dialog reached `Confirmed`.
    pub const CONFIRMED: u32 = 1 << 2;
    /// Dialog rejected before confirmation.
    pub const FAILED: u32 = 1 << 3;
    /// Dialog ended via `BYE` or RPC.
    pub const ENDED: u32 = 1 << 4;
    /// Dialog ended via timer expiry or keepalive failure.
    pub const EXPIRED: u32 = 1 << 5;
    /// An in-dialog request arrived.
    pub const REQUEST_WITHIN: u32 = 1 << 6;
    /// An in-dialog reply arrived.
    pub const REPLY_WITHIN: u32 = 1 << 7;
    /// A dialog was restored from the persistence backend.
    pub const DBLOAD: u32 = 1 << 8;
    /// The dialog is being operated on through the RPC control surface.
    pub const RPC_CONTEXT: u32 = 1 << 9;

    /// All event kinds, useful for callbacks that want everything.
    pub const ALL: u32 = CREATED
        | EARLY
        | CONFIRMED
        | FAILED
        | ENDED
        | EXPIRED
        | REQUEST_WITHIN
        | REPLY_WITHIN
        | DBLOAD
        | RPC_CONTEXT;
}

/// Payload handed to a callback: the dialog, the event kind that fired it,
/// an end reason when applicable, and which leg the triggering message (if
/// any) came from. Callbacks receive the dialog reference under no lock
/// beyond the dialog's own and must not block.
#[derive(Debug, Clone)]
pub struct CallbackEvent<'a> {
    /// Dialog the callback fired for.
    pub dialog: &'a Dialog,
    /// The event that triggered this callback.
    pub kind: u32,
    /// Set for `ended`/`expired`/`failed` events.
    pub end_reason: Option<EndReason>,
    /// Which leg's traffic triggered the event, if any.
    pub leg: LegDirection,
}

/// A registered callback. Implementors must not block; expensive work
/// should be deferred to a transaction-completion callback instead.
pub trait DialogCallback: Send + Sync + 'static {
    /// Invoked synchronously for any event in the registered mask.
    fn on_event(&self, event: &CallbackEvent<'_>);
}

impl<F> DialogCallback for F
where
    F: Fn(&CallbackEvent<'_>) + Send + Sync + 'static,
{
    fn on_event(&self, event: &CallbackEvent<'_>) {
        (self)(event)
    }
}

struct Registration {
    mask: u32,
    callback: Arc<dyn DialogCallback>,
}

/// Module-wide callback registry. Callbacks registered for the same event
/// fire in registration order; a panicking callback is caught so it cannot
/// prevent the remaining callbacks from running.
#[derive(Default)]
pub struct CallbackRegistry {
    registrations: Mutex<Vec<Registration>>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        CallbackRegistry::default()
    }

    /// Registers `callback` for every event kind set in `mask`.
    pub fn register(&self, mask: u32, callback: Arc<dyn DialogCallback>) {
        self.registrations.lock().expect("callback lock poisoned").push(Registration { mask, callback });
    }

    /// Fires every registered callback whose mask intersects `event.kind`,
    /// in registration order. A callback that panics is logged and
    /// skipped; later callbacks still run.
    pub fn dispatch(&self, event: &CallbackEvent<'_>) {
        let registrations = self.registrations.lock().expect("callback lock poisoned");
        for reg in registrations.iter() {
            if reg.mask & event.kind == 0 {
                continue;
            }
            let callback = reg.callback.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback.on_event(event)));
            if outcome.is_err() {
                log::warn!("dialog callback panicked while handling event {:#x}", event.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_fire_in_registration_order() {
        let registry = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        registry.register(event_mask::ENDED, Arc::new(move |_: &CallbackEvent<'_>| o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        registry.register(event_mask::ENDED, Arc::new(move |_: &CallbackEvent<'_>| o2.lock().unwrap().push(2)));

        let dialog = crate::dialog::Dialog::new(
            crate::dialog::Iuid { hash_entry: 0, hash_id: 1 },
            crate::dialog::NewDialog {
                call_id: "c1".into(),
                from_tag: "a".into(),
                req_uri: "sip:bob@biloxi.example.com".into(),
                from_uri: "sip:alice@atlanta.example.com".into(),
                to_uri: "sip:bob@biloxi.example.com".into(),
                caller_contact: "sip:alice@client.atlanta.example.com".into(),
                caller_cseq: "1 INVITE".into(),
                lifetime: std::time::Duration::from_secs(60),
            },
        );

        registry.dispatch(&CallbackEvent {
            dialog: &dialog,
            kind: event_mask::ENDED,
            end_reason: Some(EndReason::Bye),
            leg: LegDirection::None,
        });

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let registry = CallbackRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));

        registry.register(event_mask::ENDED, Arc::new(|_: &CallbackEvent<'_>| panic!("boom")));
        let ran2 = ran.clone();
        registry.register(event_mask::ENDED, Arc::new(move |_: &CallbackEvent<'_>| {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));

        let dialog = crate::dialog::Dialog::new(
            crate::dialog::Iuid { hash_entry: 0, hash_id: 2 },
            crate::dialog::NewDialog {
                call_id: "c2".into(),
                from_tag: "a".into(),
                req_uri: "sip:bob@biloxi.example.com".into(),
                from_uri: "sip:alice@atlanta.example.com".into(),
                to_uri: "sip:bob@biloxi.example.com".into(),
                caller_contact: "sip:alice@client.atlanta.example.com".into(),
                caller_cseq: "1 INVITE".into(),
                lifetime: std::time::Duration::from_secs(60),
            },
        );

        registry.dispatch(&CallbackEvent {
            dialog: &dialog,
            kind: event_mask::ENDED,
            end_reason: Some(EndReason::Bye),
            leg: LegDirection::None,
        });

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
