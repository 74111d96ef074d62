#![deny(missing_docs)]
//! Startup configuration for the dialog core.

use std::time::Duration;

use dialog_util::ArcStr;

use crate::profile::ProfileKind;
use crate::{Error, Result};

/// How in-dialog requests are matched back to a dialog via the
/// Record-Route IUID parameter (`rr_param`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequentialMatchMode {
    /// Trust the Record-Route IUID parameter; fail the match if absent or
    /// stale rather than falling back to tag-based lookup.
    StrictId,
    /// Prefer the IUID parameter; fall back to tag-based lookup on a miss.
    Fallback,
    /// Ignore the IUID parameter entirely; always match by tags.
    NoId,
}

/// One of the three database persistence driver modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    /// Persistence disabled.
    None,
    /// Write-through on every change.
    Realtime,
    /// Periodic write-back of dirty records.
    Delayed,
    /// Single dump on process exit.
    Shutdown,
}

/// A profile declared at startup, paired with its kind.
#[derive(Debug, Clone)]
pub struct ProfileDecl {
    /// Profile name.
    pub name: ArcStr,
    /// Whether the profile carries a value.
    pub kind: ProfileKind,
}

/// Fully validated startup configuration. Build via [`ConfigBuilder`];
/// invalid parameters fail at build time, matching the "refuse to
/// initialize" propagation policy for configuration errors.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of table shards, rounded up to a power of two.
    pub hash_size: u32,
    /// Default dialog lifetime, once confirmed.
    pub default_timeout: Duration,
    /// How long an `Unconfirmed`/`Early` dialog may live before the cleanup
    /// sweep purges it.
    pub early_timeout: Duration,
    /// How long a `ConfirmedNoAck` dialog may wait for the ACK.
    pub noack_timeout: Duration,
    /// Grace period applied when the dialog ends.
    pub end_timeout: Duration,
    /// Keepalive interval; `0` disables the keepalive loop. Must be `0` or
    /// `>= 30s`.
    pub keepalive_interval: Duration,
    /// Consecutive unanswered keepalives before the dialog is force-ended.
    pub keepalive_failed_limit: u32,
    /// Whether re-entrant in-proxy requests carrying this module's
    /// Record-Route IUID parameter are recognized and deduplicated.
    pub detect_spirals: bool,
    /// Whether the dialog waits for an ACK before becoming fully
    /// `Confirmed`. When `false`, `noack_timeout` is never armed (Open
    /// Question (a)).
    pub wait_ack: bool,
    /// Whether in-dialog traffic is allowed to rearm the lifetime timer by
    /// default (mirrored into each dialog's `timeout-noreset` iflag).
    pub timeout_noreset: bool,
    /// In-dialog request matching strategy.
    pub sequential_match_mode: SequentialMatchMode,
    /// First `hash_id` issued per shard.
    pub id_start: u64,
    /// Increment between `hash_id`s issued by the same shard; lets a
    /// federation of nodes keep IUIDs globally distinct.
    pub id_step: u64,
    /// Profiles declared without a value.
    pub profiles_no_value: Vec<ArcStr>,
    /// Profiles declared with a value.
    pub profiles_with_value: Vec<ArcStr>,
    /// Persistence driver mode.
    pub db_mode: DbMode,
    /// Period between delayed-mode flushes.
    pub db_update_period: Duration,
    /// How many trailing Record-Route entries from intermediate proxies to
    /// retain on re-INVITEs (0..3).
    pub keep_proxy_rr: u8,
    /// Name of the Record-Route parameter carrying the IUID.
    pub rr_param: String,
}

impl Config {
    /// Starts building a configuration with the source's documented
    /// defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// All profiles declared at startup, paired with their kind.
    pub fn profile_decls(&self) -> Vec<ProfileDecl> {
        self.profiles_no_value
            .iter()
            .map(|name| ProfileDecl {
                name: name.clone(),
                kind: ProfileKind::NoValue,
            })
            .chain(self.profiles_with_value.iter().map(|name| ProfileDecl {
                name: name.clone(),
                kind: ProfileKind::WithValue,
            }))
            .collect()
    }
}

/// Builder for [`Config`], modeled on `endpoint::Builder`'s fluent style.
pub struct ConfigBuilder {
    hash_size: u32,
    default_timeout: Duration,
    early_timeout: Duration,
    noack_timeout: Duration,
    end_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_failed_limit: u32,
    detect_spirals: bool,
    wait_ack: bool,
    timeout_noreset: bool,
    sequential_match_mode: SequentialMatchMode,
    id_start: u64,
    id_step: u64,
    profiles_no_value: Vec<ArcStr>,
    profiles_with_value: Vec<ArcStr>,
    db_mode: DbMode,
    db_update_period: Duration,
    keep_proxy_rr: u8,
    rr_param: String,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            hash_size: 4096,
            default_timeout: Duration::from_secs(12 * 3600),
            early_timeout: Duration::from_secs(300),
            noack_timeout: Duration::from_secs(60),
            end_timeout: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(0),
            keepalive_failed_limit: 1,
            detect_spirals: true,
            wait_ack: true,
            timeout_noreset: false,
            sequential_match_mode: SequentialMatchMode::Fallback,
            id_start: 0,
            id_step: 1,
            profiles_no_value: Vec::new(),
            profiles_with_value: Vec::new(),
            db_mode: DbMode::None,
            db_update_period: Duration::from_secs(90),
            keep_proxy_rr: 0,
            rr_param: "did".to_string(),
        }
    }
}

impl ConfigBuilder {
    /// Sets `hash-size`. Rounded up to the nearest power of two at build
    /// time; `0` is clamped to `1` (the single-shard degenerate case).
    pub fn hash_size(mut self, size: u32) -> Self {
        self.hash_size = size;
        self
    }

    /// Sets `default-timeout`, in seconds.
    pub fn default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout = Duration::from_secs(secs);
        self
    }

    /// Sets `early-timeout`, in seconds.
    pub fn early_timeout(mut self, secs: u64) -> Self {
        self.early_timeout = Duration::from_secs(secs);
        self
    }

    /// Sets `noack-timeout`, in seconds.
    pub fn noack_timeout(mut self, secs: u64) -> Self {
        self.noack_timeout = Duration::from_secs(secs);
        self
    }

    /// Sets `end-timeout`, in seconds.
    pub fn end_timeout(mut self, secs: u64) -> Self {
        self.end_timeout = Duration::from_secs(secs);
        self
    }

    /// Sets `keepalive-interval`, in seconds. Must be `0` (disabled) or
    /// `>= 30`.
    pub fn keepalive_interval(mut self, secs: u64) -> Self {
        self.keepalive_interval = Duration::from_secs(secs);
        self
    }

    /// Sets `keepalive-failed-limit`.
    pub fn keepalive_failed_limit(mut self, limit: u32) -> Self {
        self.keepalive_failed_limit = limit;
        self
    }

    /// Sets `detect-spirals`.
    pub fn detect_spirals(mut self, enabled: bool) -> Self {
        self.detect_spirals = enabled;
        self
    }

    /// Sets `wait-ack`.
    pub fn wait_ack(mut self, enabled: bool) -> Self {
        self.wait_ack = enabled;
        self
    }

    /// Sets `timeout-noreset`.
    pub fn timeout_noreset(mut self, enabled: bool) -> Self {
        self.timeout_noreset = enabled;
        self
    }

    /// Sets `sequential-match-mode`.
    pub fn sequential_match_mode(mut self, mode: SequentialMatchMode) -> Self {
        self.sequential_match_mode = mode;
        self
    }

    /// Sets `id-start`.
    pub fn id_start(mut self, id: u64) -> Self {
        self.id_start = id;
        self
    }

    /// Sets `id-step`.
    pub fn id_step(mut self, step: u64) -> Self {
        self.id_step = step;
        self
    }

    /// Declares a `profiles-no-value` entry.
    pub fn profile_no_value(mut self, name: impl Into<ArcStr>) -> Self {
        self.profiles_no_value.push(name.into());
        self
    }

    /// Declares a `profiles-with-value` entry.
    pub fn profile_with_value(mut self, name: impl Into<ArcStr>) -> Self {
        self.profiles_with_value.push(name.into());
        self
    }

    /// Sets `db-mode`.
    pub fn db_mode(mut self, mode: DbMode) -> Self {
        self.db_mode = mode;
        self
    }

    /// Sets `db-update-period`, in seconds.
    pub fn db_update_period(mut self, secs: u64) -> Self {
        self.db_update_period = Duration::from_secs(secs);
        self
    }

    /// Sets `keep-proxy-rr` (0..3).
    pub fn keep_proxy_rr(mut self, value: u8) -> Self {
        self.keep_proxy_rr = value;
        self
    }

    /// Sets the Record-Route parameter name carrying the IUID.
    pub fn rr_param(mut self, name: impl Into<String>) -> Self {
        self.rr_param = name.into();
        self
    }

    /// Validates every parameter and builds the immutable [`Config`].
    /// Mirrors the source's startup sanitation of `hash_size`: values that
    /// aren't already a power of two are rounded *down* to the nearest one
    /// (with a warning logged), rather than rejected outright.
    pub fn build(self) -> Result<Config> {
        let hash_size = sanitize_hash_size(self.hash_size);

        if self.keepalive_interval.as_secs() != 0 && self.keepalive_interval.as_secs() < 30 {
            return Err(Error::Configuration(
                "keepalive-interval must be 0 or >= 30 seconds".to_string(),
            ));
        }

        if self.keep_proxy_rr > 3 {
            return Err(Error::Configuration("keep-proxy-rr must be in 0..=3".to_string()));
        }

        if self.id_step == 0 {
            return Err(Error::Configuration("id-step must be >= 1".to_string()));
        }

        if self.rr_param.is_empty() {
            return Err(Error::Configuration("rr_param must not be empty".to_string()));
        }

        Ok(Config {
            hash_size,
            default_timeout: self.default_timeout,
            early_timeout: self.early_timeout,
            noack_timeout: self.noack_timeout,
            end_timeout: self.end_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_failed_limit: self.keepalive_failed_limit,
            detect_spirals: self.detect_spirals,
            wait_ack: self.wait_ack,
            timeout_noreset: self.timeout_noreset,
            sequential_match_mode: self.sequential_match_mode,
            id_start: self.id_start,
            id_step: self.id_step,
            profiles_no_value: self.profiles_no_value,
            profiles_with_value: self.profiles_with_value,
            db_mode: self.db_mode,
            db_update_period: self.db_update_period,
            keep_proxy_rr: self.keep_proxy_rr,
            rr_param: self.rr_param,
        })
    }
}

fn sanitize_hash_size(requested: u32) -> u32 {
    if requested < 1 {
        log::warn!("hash_size is smaller than 1, rounding to 1");
        return 1;
    }
    if requested.is_power_of_two() {
        return requested;
    }
    let rounded = requested.next_power_of_two() / 2;
    let rounded = rounded.max(1);
    log::warn!("hash_size {requested} is not a power of two, rounding down to {rounded}");
    rounded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_successfully() {
        let cfg = Config::builder().build().unwrap();
        assert_eq!(cfg.hash_size, 4096);
        assert!(cfg.wait_ack);
    }

    #[test]
    fn hash_size_rounds_to_power_of_two() {
        let cfg = Config::builder().hash_size(100).build().unwrap();
        assert_eq!(cfg.hash_size, 64);
    }

    #[test]
    fn rejects_short_keepalive_interval() {
        let err = Config::builder().keepalive_interval(10).build().unwrap_err();
        assert_matches!(err, Error::Configuration(_));
    }
}
