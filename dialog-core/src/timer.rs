//! The expiration timer ring: a single ordered list of
//! per-dialog absolute deadlines, supporting insert, reschedule, cancel and
//! bulk extraction of everything due by "now".

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::dialog::Dialog;

struct TimerLink {
    dialog: Dialog,
    expiry: Instant,
}

/// Ordered per-dialog timeout list. Protected by a single mutex, as
/// described for the concurrency model: insertions are bounded by the
/// number of live dialogs and happen at state-transition moments, so
/// contention is expected to be low even with one lock for the whole ring.
#[derive(Default)]
pub struct TimerRing {
    links: Mutex<Vec<TimerLink>>,
}

impl TimerRing {
    /// Creates an empty timer ring.
    pub fn new() -> Self {
        TimerRing::default()
    }

    /// Schedules (or reschedules, if already linked) `dialog` to expire
    /// `seconds` from now. Equivalent to [`TimerRing::reschedule`].
    pub fn insert(&self, dialog: &Dialog, seconds: Duration) {
        let expiry = Instant::now() + seconds;
        let mut links = self.links.lock().expect("timer lock poisoned");

        if dialog.is_timer_linked() {
            remove_link(&mut links, dialog);
        }

        // Keep the list sorted ascending by expiry; entries with equal
        // expiry retain FIFO order, so the new entry is inserted after the
        // last entry with expiry <= its own.
        let pos = links.partition_point(|link| link.expiry <= expiry);
        links.insert(pos, TimerLink { dialog: dialog.clone(), expiry });
        dialog.set_timer_linked(true);
    }

    /// Equivalent to [`TimerRing::insert`]; kept as a distinct name to match
    /// the call sites that are conceptually "rearming" rather than arming
    /// for the first time.
    pub fn reschedule(&self, dialog: &Dialog, seconds: Duration) {
        self.insert(dialog, seconds);
    }

    /// Cancels `dialog`'s timer, if any.
    pub fn cancel(&self, dialog: &Dialog) {
        if !dialog.is_timer_linked() {
            return;
        }
        let mut links = self.links.lock().expect("timer lock poisoned");
        remove_link(&mut links, dialog);
    }

    /// Detaches and returns every entry whose expiry is `<= now`, clearing
    /// their "linked" bit. The returned list is processed by the caller
    /// outside the ring's lock.
    pub fn extract_expired(&self, now: Instant) -> Vec<Dialog> {
        let mut links = self.links.lock().expect("timer lock poisoned");
        let split = links.partition_point(|link| link.expiry <= now);
        let expired: Vec<TimerLink> = links.drain(..split).collect();
        drop(links);

        expired
            .into_iter()
            .map(|link| {
                link.dialog.set_timer_linked(false);
                link.dialog
            })
            .collect()
    }

    /// Number of dialogs currently linked into the ring.
    pub fn len(&self) -> usize {
        self.links.lock().expect("timer lock poisoned").len()
    }

    /// Whether the ring currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_link(links: &mut Vec<TimerLink>, dialog: &Dialog) {
    if let Some(idx) = links.iter().position(|link| link.dialog.iuid() == dialog.iuid()) {
        links.remove(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::{Iuid, NewDialog};

    fn make(id: u64) -> Dialog {
        Dialog::new(
            Iuid { hash_entry: 0, hash_id: id },
            NewDialog {
                call_id: format!("c{id}").into(),
                from_tag: "a".into(),
                req_uri: "sip:bob@biloxi.example.com".into(),
                from_uri: "sip:alice@atlanta.example.com".into(),
                to_uri: "sip:bob@biloxi.example.com".into(),
                caller_contact: "sip:alice@client.atlanta.example.com".into(),
                caller_cseq: "1 INVITE".into(),
                lifetime: Duration::from_secs(3600),
            },
        )
    }

    #[test]
    fn extract_expired_returns_only_due_entries() {
        let ring = TimerRing::new();
        let soon = make(1);
        let later = make(2);

        ring.insert(&soon, Duration::from_millis(0));
        ring.insert(&later, Duration::from_secs(3600));

        std::thread::sleep(Duration::from_millis(5));
        let expired = ring.extract_expired(Instant::now());

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].iuid(), soon.iuid());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn reschedule_moves_entry_without_duplicating() {
        let ring = TimerRing::new();
        let d = make(1);
        ring.insert(&d, Duration::from_millis(0));
        ring.reschedule(&d, Duration::from_secs(3600));

        assert_eq!(ring.len(), 1);
        let expired = ring.extract_expired(Instant::now());
        assert!(expired.is_empty());
    }

    #[test]
    fn cancel_unlinks() {
        let ring = TimerRing::new();
        let d = make(1);
        ring.insert(&d, Duration::from_secs(60));
        ring.cancel(&d);
        assert_eq!(ring.len(), 0);
        assert!(!d.is_timer_linked());
    }

    #[test]
    fn equal_expiry_keeps_fifo_order() {
        let ring = TimerRing::new();
        let first = make(1);
        let second = make(2);
        let past = Instant::now();

        // Insert both already-expired with the exact same deadline.
        ring.insert(&first, Duration::from_millis(0));
        ring.insert(&second, Duration::from_millis(0));

        let expired = ring.extract_expired(past + Duration::from_millis(5));
        assert_eq!(expired[0].iuid(), first.iuid());
        assert_eq!(expired[1].iuid(), second.iuid());
    }
}
