//! The profile index: named groupings of dialogs,
//! optionally keyed by a string value.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::SystemTime;

use dialog_util::ArcStr;

use crate::dialog::{Dialog, Iuid, ProfileLink};
use crate::table::DialogTable;
use crate::{Error, Result};

/// Whether a profile is a plain set of dialogs or a multiset keyed by a
/// string value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    /// A dialog is either in the profile or not.
    NoValue,
    /// A dialog may appear under multiple distinct values.
    WithValue,
}

/// A single named bucket. Holds only [`Iuid`]s — a *weak* reference, per
/// the cyclic-reference design note: the dialog owns the strong
/// [`ProfileLink`] and the profile only ever re-validates membership
/// through the table.
struct Profile {
    kind: ProfileKind,
    // `None` key is used for no-value profiles; `Some(value)` buckets for
    // with-value profiles.
    members: Mutex<HashMap<Option<ArcStr>, HashSet<Iuid>>>,
}

impl Profile {
    fn new(kind: ProfileKind) -> Self {
        Profile {
            kind,
            members: Mutex::new(HashMap::new()),
        }
    }
}

/// Secondary index grouping dialogs by named profile, declared at startup.
#[derive(Default)]
pub struct ProfileIndex {
    profiles: HashMap<ArcStr, Profile>,
}

impl ProfileIndex {
    /// Builds an index with no profiles declared.
    pub fn new() -> Self {
        ProfileIndex::default()
    }

    /// Declares a profile at startup. Matches `profiles-no-value` /
    /// `profiles-with-value` configuration lists.
    pub fn declare(&mut self, name: impl Into<ArcStr>, kind: ProfileKind) {
        self.profiles.insert(name.into(), Profile::new(kind));
    }

    fn get(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| Error::InputInvalid(format!("unknown profile '{name}'")))
    }

    /// Adds `dialog` to `profile` under an optional `value`. Duplicates
    /// under distinct values are allowed for with-value profiles.
    pub fn set(&self, profile: &str, dialog: &Dialog, value: Option<ArcStr>) -> Result<()> {
        let p = self.get(profile)?;
        if p.kind == ProfileKind::NoValue && value.is_some() {
            return Err(Error::InputInvalid(format!("profile '{profile}' does not take a value")));
        }

        let mut members = p.members.lock().expect("profile lock poisoned");
        members.entry(value.clone()).or_default().insert(dialog.iuid());
        drop(members);

        dialog.profile_links_mut().insert(ProfileLink {
            profile: profile.into(),
            value,
        });
        Ok(())
    }

    /// Removes `dialog` from `profile` under an optional `value`.
    pub fn unset(&self, profile: &str, dialog: &Dialog, value: Option<ArcStr>) -> Result<()> {
        let p = self.get(profile)?;
        let mut members = p.members.lock().expect("profile lock poisoned");
        if let Some(bucket) = members.get_mut(&value) {
            bucket.remove(&dialog.iuid());
            if bucket.is_empty() {
                members.remove(&value);
            }
        }
        drop(members);

        dialog.profile_links_mut().remove(&ProfileLink {
            profile: profile.into(),
            value,
        });
        Ok(())
    }

    /// Removes every membership for `dialog` across all profiles. Called on
    /// dialog deletion, before the last strong reference is dropped.
    pub fn unlink_all(&self, dialog: &Dialog) {
        let links: Vec<ProfileLink> = dialog.profile_links_mut().drain().collect();
        for link in links {
            if let Ok(p) = self.get(&link.profile) {
                let mut members = p.members.lock().expect("profile lock poisoned");
                if let Some(bucket) = members.get_mut(&link.value) {
                    bucket.remove(&dialog.iuid());
                    if bucket.is_empty() {
                        members.remove(&link.value);
                    }
                }
            }
        }
    }

    /// O(1) membership test, answered from the dialog's own link set rather
    /// than visiting the profile bucket.
    pub fn is_in(dialog: &Dialog, profile: &str, value: Option<&str>) -> bool {
        dialog.profile_links_mut().iter().any(|link| {
            link.profile.as_ref() == profile && link.value.as_deref() == value
        })
    }

    /// Current membership count for `value`, or the profile's total count
    /// if `value` is omitted.
    pub fn size(&self, profile: &str, value: Option<&str>) -> Result<usize> {
        let p = self.get(profile)?;
        let members = p.members.lock().expect("profile lock poisoned");
        let size = match value {
            Some(v) => members.get(&Some(ArcStr::from(v))).map(|s| s.len()).unwrap_or(0),
            None => members.values().map(|s| s.len()).sum(),
        };
        Ok(size)
    }

    /// Iterates live members of `profile`/`value` under the profile lock,
    /// resolving each [`Iuid`] back to a [`Dialog`] through `table`. Entries
    /// whose dialog has already been unlinked (a benign race with deletion)
    /// are skipped.
    pub fn for_each(&self, profile: &str, value: Option<&str>, table: &DialogTable, mut f: impl FnMut(&Dialog)) -> Result<()> {
        let p = self.get(profile)?;
        let members = p.members.lock().expect("profile lock poisoned");
        let iuids: Vec<Iuid> = match value {
            Some(v) => members.get(&Some(ArcStr::from(v))).into_iter().flatten().copied().collect(),
            None => members.values().flatten().copied().collect(),
        };
        drop(members);

        for iuid in iuids {
            if let Some(dialog) = table.lookup_by_iuid(iuid) {
                f(&dialog);
            }
        }
        Ok(())
    }
}

/// A single entry in a [`RemoteProfile`]: not tied to any local dialog, and
/// carrying its own explicit expiry so a sweep can reap it.
struct RemoteEntry {
    value: ArcStr,
    expires_at: SystemTime,
}

/// A profile variant for entries that originate from cluster peers rather
/// than local dialogs.
#[derive(Default)]
pub struct RemoteProfile {
    entries: Mutex<Vec<RemoteEntry>>,
}

impl RemoteProfile {
    /// Creates an empty remote profile.
    pub fn new() -> Self {
        RemoteProfile::default()
    }

    /// Adds or refreshes an entry with the given expiry.
    pub fn set(&self, value: impl Into<ArcStr>, expires_at: SystemTime) {
        let value = value.into();
        let mut entries = self.entries.lock().expect("remote profile lock poisoned");
        entries.retain(|e| e.value != value);
        entries.push(RemoteEntry { value, expires_at });
    }

    /// Removes expired entries as of `now`, returning how many were swept.
    pub fn sweep(&self, now: SystemTime) -> usize {
        let mut entries = self.entries.lock().expect("remote profile lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.expires_at > now);
        before - entries.len()
    }

    /// Number of currently live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("remote profile lock poisoned").len()
    }

    /// Whether the remote profile currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
