//! Account lockout.
//!
//! Consecutive authentication failures are counted per account id; once
//! the count reaches the threshold the account is locked for the cooldown
//! window. All mutation happens under the map's per-entry lock, so a
//! burst of concurrent failures admits at most `threshold` outcomes that
//! observed the account unlocked. Entries are never deleted; a stale
//! entry with an elapsed `locked_until` behaves like a fresh one after
//! `reset`.

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct LockoutConfig {
    pub threshold: u32,
    pub cooldown_secs: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        LockoutConfig {
            threshold: 5,
            cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Default)]
struct LockoutEntry {
    failure_count: u32,
    locked_until: i64,
}

pub struct LockoutCounter {
    entries: DashMap<String, LockoutEntry>,
    config: LockoutConfig,
}

impl LockoutCounter {
    pub fn new(config: LockoutConfig) -> Self {
        LockoutCounter {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn is_locked(&self, account_id: &str, now: i64) -> bool {
        self.entries
            .get(account_id)
            .map(|e| now < e.locked_until)
            .unwrap_or(false)
    }

    /// Count a failed attempt. Returns whether the account was already
    /// locked at the moment the failure landed.
    pub fn record_failure(&self, account_id: &str, now: i64) -> bool {
        let mut entry = self.entries.entry(account_id.to_string()).or_default();
        let already_locked = now < entry.locked_until;
        entry.failure_count = entry.failure_count.saturating_add(1);
        if entry.failure_count >= self.config.threshold {
            entry.locked_until = now + self.config.cooldown_secs;
        }
        already_locked
    }

    /// Successful authentication clears all lockout state for the account.
    pub fn reset(&self, account_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(account_id) {
            entry.failure_count = 0;
            entry.locked_until = 0;
        }
    }

    #[cfg(test)]
    fn failure_count(&self, account_id: &str) -> u32 {
        self.entries
            .get(account_id)
            .map(|e| e.failure_count)
            .unwrap_or(0)
    }
}
