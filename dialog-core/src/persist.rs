//! The portable, serializable dialog record. `PersistedDialog` is what the
//! [`crate::external::PersistenceDriver`]
//! reads and writes; JSON dumps follow the same field set.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dialog_util::ArcStr;

use crate::dialog::{Dialog, Iuid, Leg, LEG_CALLEE, LEG_CALLER};
use crate::state::DialogState;
use crate::vars::{DialogVar, VarFlag, VariableStore};

/// One leg's persisted fields.
#[derive(Debug, Clone, Default)]
pub struct PersistedLeg {
    /// Leg tag.
    pub tag: Option<String>,
    /// Leg contact URI.
    pub contact: Option<String>,
    /// Last CSeq string.
    pub cseq: Option<String>,
    /// Ordered route set.
    pub route_set: Vec<String>,
    /// Bound local socket, textual form (`ip:port`).
    pub socket: Option<String>,
}

/// A profile membership, as persisted.
#[derive(Debug, Clone)]
pub struct PersistedProfile {
    /// Profile name.
    pub profile: String,
    /// Value keying the membership, if any.
    pub value: Option<String>,
}

/// A variable cell, as persisted (the flag itself is not round-tripped:
/// on load every cell starts `Clean`).
#[derive(Debug, Clone)]
pub struct PersistedVar {
    /// Variable key.
    pub key: String,
    /// Variable value.
    pub value: String,
}

/// The named-field portable record written by the persistence driver.
#[derive(Debug, Clone)]
pub struct PersistedDialog {
    /// Shard index (`h_entry`).
    pub h_entry: u32,
    /// Per-shard counter (`h_id`).
    pub h_id: u64,
    /// Reference count observed at serialization time (diagnostic only;
    /// not meaningful after reload).
    pub r#ref: usize,
    /// Call-ID.
    pub call_id: String,
    /// From-URI.
    pub from_uri: String,
    /// To-URI.
    pub to_uri: String,
    /// Request-URI.
    pub req_uri: String,
    /// Lifecycle state.
    pub state: DialogState,
    /// Unix seconds, or `None` if unset.
    pub start_ts: Option<u64>,
    /// Unix seconds.
    pub init_ts: u64,
    /// Unix seconds, or `None` if unset.
    pub end_ts: Option<u64>,
    /// Absolute timeout deadline, Unix seconds (informational: the live
    /// deadline lives in the timer ring, not the persisted record).
    pub timeout: u64,
    /// Configured lifetime, seconds.
    pub lifetime: u64,
    /// Persistence dirty bits.
    pub dflags: u32,
    /// Script-visible flags.
    pub sflags: u32,
    /// Internal flags.
    pub iflags: u32,
    /// Caller leg.
    pub caller: PersistedLeg,
    /// Callee leg.
    pub callee: PersistedLeg,
    /// Profile memberships.
    pub profiles: Vec<PersistedProfile>,
    /// Variable cells.
    pub variables: Vec<PersistedVar>,
}

fn to_unix(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn from_unix(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn leg_snapshot(dialog: &Dialog, leg: usize) -> PersistedLeg {
    let leg = dialog.leg(leg);
    PersistedLeg {
        tag: leg.tag().map(|t| t.to_string()),
        contact: leg.contact().map(|c| c.to_string()),
        cseq: leg.cseq(),
        route_set: leg.route_set().iter().map(|r| r.to_string()).collect(),
        socket: leg.socket().map(|s| s.to_string()),
    }
}

fn restore_leg_routing(leg: &Leg, record: &PersistedLeg) {
    if !record.route_set.is_empty() {
        leg.set_route_set(record.route_set.iter().map(|r| ArcStr::from(r.as_str())).collect());
    }
    if let Some(socket) = &record.socket {
        if let Ok(addr) = socket.parse() {
            leg.set_socket(addr);
        }
    }
}

/// Serializes `dialog` into its portable form, suitable for
/// [`crate::external::PersistenceDriver::store`]/`update` or a JSON dump.
pub fn snapshot(dialog: &Dialog) -> PersistedDialog {
    let iuid = dialog.iuid();
    let profiles = dialog
        .profile_links_mut()
        .iter()
        .map(|link| PersistedProfile {
            profile: link.profile.to_string(),
            value: link.value.as_ref().map(|v| v.to_string()),
        })
        .collect();
    let variables = dialog
        .all_vars()
        .into_iter()
        .map(|v| PersistedVar {
            key: v.key.to_string(),
            value: v.value.to_string(),
        })
        .collect();

    PersistedDialog {
        h_entry: iuid.hash_entry,
        h_id: iuid.hash_id,
        r#ref: 1,
        call_id: dialog.call_id().to_string(),
        from_uri: dialog.from_uri().to_string(),
        to_uri: dialog.to_uri().to_string(),
        req_uri: dialog.req_uri().to_string(),
        state: dialog.state(),
        start_ts: dialog.start_ts().map(to_unix),
        init_ts: to_unix(dialog.init_ts()),
        end_ts: dialog.end_ts().map(to_unix),
        timeout: 0,
        lifetime: dialog.lifetime(),
        dflags: dialog.dflags(),
        sflags: dialog.sflags(),
        iflags: dialog.iflags(),
        caller: leg_snapshot(dialog, LEG_CALLER),
        callee: leg_snapshot(dialog, LEG_CALLEE),
        profiles,
        variables,
    }
}

/// Rebuilds a [`Dialog`] from a previously persisted record, for the
/// `load_all` startup path. `state`, `start_ts`, `end_ts`, `dflags`, both
/// legs' route sets/sockets/CSeqs, and the dialog-owned profile links
/// (`record.profiles`) all come back exactly as persisted — a dialog
/// reloaded mid-call reports the same lifecycle state it had when it was
/// flushed, rather than reverting to `Unconfirmed`. The rebuilt dialog is
/// *not* re-inserted into any table or [`crate::profile::ProfileIndex`]
/// bucket; the caller (the maintenance loop driving `dbload`) is
/// responsible for that, the same way a freshly parsed `INVITE` is.
pub fn restore(record: &PersistedDialog) -> Dialog {
    let dialog = Dialog::new(
        Iuid {
            hash_entry: record.h_entry,
            hash_id: record.h_id,
        },
        crate::dialog::NewDialog {
            call_id: ArcStr::from(record.call_id.as_str()),
            from_tag: record.caller.tag.clone().map(ArcStr::from).unwrap_or_default(),
            req_uri: ArcStr::from(record.req_uri.as_str()),
            from_uri: ArcStr::from(record.from_uri.as_str()),
            to_uri: ArcStr::from(record.to_uri.as_str()),
            caller_contact: record.caller.contact.clone().map(ArcStr::from).unwrap_or_default(),
            caller_cseq: record.caller.cseq.clone().unwrap_or_default(),
            lifetime: Duration::from_secs(record.lifetime),
        },
    );

    if let Some(tag) = &record.callee.tag {
        dialog.leg(LEG_CALLEE).set_tag(ArcStr::from(tag.as_str()));
    }
    if let Some(contact) = &record.callee.contact {
        dialog.leg(LEG_CALLEE).set_contact(ArcStr::from(contact.as_str()));
    }
    if let Some(cseq) = &record.callee.cseq {
        dialog.leg(LEG_CALLEE).set_cseq(cseq.clone());
    }
    restore_leg_routing(dialog.leg(LEG_CALLER), &record.caller);
    restore_leg_routing(dialog.leg(LEG_CALLEE), &record.callee);

    dialog.set_state_raw(record.state);
    dialog.set_start_ts_raw(record.start_ts.map(from_unix));
    dialog.set_end_ts_raw(record.end_ts.map(from_unix));
    dialog.set_sflags(record.sflags);
    dialog.set_iflags(record.iflags);
    dialog.set_dflags_raw(record.dflags);

    {
        let mut links = dialog.profile_links_mut();
        for profile in &record.profiles {
            links.insert(crate::dialog::ProfileLink {
                profile: ArcStr::from(profile.profile.as_str()),
                value: profile.value.clone().map(ArcStr::from),
            });
        }
    }

    for var in &record.variables {
        let mut vars = dialog.vars_mut();
        vars.push(DialogVar {
            key: ArcStr::from(var.key.as_str()),
            value: ArcStr::from(var.value.as_str()),
            flag: VarFlag::Clean,
        });
    }

    dialog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DialogEvent;
    use std::time::Duration;

    fn make() -> Dialog {
        Dialog::new(
            Iuid { hash_entry: 2, hash_id: 9 },
            crate::dialog::NewDialog {
                call_id: "c1".into(),
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
    fn round_trip_preserves_persisted_fields() {
        let dlg = make();
        dlg.apply_event(DialogEvent::Provisional).unwrap();
        dlg.apply_event(DialogEvent::FinalOk).unwrap();
        dlg.leg(LEG_CALLEE).set_tag("b".into());
        dlg.set_var("k".into(), "v".into());

        let record = snapshot(&dlg);
        assert_eq!(record.h_entry, 2);
        assert_eq!(record.h_id, 9);
        assert_eq!(record.call_id, "c1");
        assert_eq!(record.state, DialogState::ConfirmedNoAck);
        assert!(record.start_ts.is_some());

        let restored = restore(&record);
        assert_eq!(restored.iuid(), dlg.iuid());
        assert_eq!(restored.call_id().as_ref(), dlg.call_id().as_ref());
        assert_eq!(restored.to_tag().unwrap().as_ref(), "b");
        assert_eq!(restored.get_var("k").unwrap().as_ref(), "v");
        assert_eq!(restored.state(), DialogState::ConfirmedNoAck);
        assert_eq!(restored.start_ts().map(to_unix), dlg.start_ts().map(to_unix));
    }

    #[test]
    fn round_trip_preserves_confirmed_state_and_leg_routing() {
        let dlg = make();
        dlg.apply_event(DialogEvent::Provisional).unwrap();
        dlg.apply_event(DialogEvent::FinalOk).unwrap();
        dlg.leg(LEG_CALLEE).set_tag("b".into());
        dlg.apply_event(DialogEvent::Ack).unwrap();
        dlg.leg(LEG_CALLER).set_route_set(vec!["sip:proxy1.example.com".into(), "sip:proxy2.example.com".into()]);
        dlg.leg(LEG_CALLEE)
            .set_socket("203.0.113.5:5060".parse().unwrap());
        dlg.leg(LEG_CALLEE).set_cseq("2 INVITE".into());

        let record = snapshot(&dlg);
        assert_eq!(record.state, DialogState::Confirmed);
        assert!(record.end_ts.is_none());

        let restored = restore(&record);
        assert_eq!(restored.state(), DialogState::Confirmed);
        assert_eq!(restored.end_ts(), None);
        assert_eq!(
            restored.leg(LEG_CALLER).route_set().iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            vec!["sip:proxy1.example.com".to_string(), "sip:proxy2.example.com".to_string()]
        );
        assert_eq!(restored.leg(LEG_CALLEE).socket().unwrap(), "203.0.113.5:5060".parse().unwrap());
        assert_eq!(restored.leg(LEG_CALLEE).cseq().unwrap(), "2 INVITE");
    }

    #[test]
    fn round_trip_preserves_profile_membership_and_dflags() {
        let dlg = make();
        dlg.profile_links_mut().insert(crate::dialog::ProfileLink {
            profile: "active".into(),
            value: None,
        });
        dlg.clear_dirty();
        assert_eq!(dlg.dflags(), 0);

        let record = snapshot(&dlg);
        assert_eq!(record.profiles.len(), 1);
        assert_eq!(record.profiles[0].profile, "active");
        assert_eq!(record.dflags, 0);

        let restored = restore(&record);
        assert_eq!(restored.dflags(), 0);
        let links = restored.profile_links_mut();
        assert!(links.contains(&crate::dialog::ProfileLink { profile: "active".into(), value: None }));
    }
}
