//! TTL-based IP blocking.
//!
//! Blocks expire on their own: an expired entry is removed by the first read
//! that notices it (`is_blocked`, `active_entries`) or by an explicit
//! `sweep_expired`. Re-blocking an address that is already blocked restarts
//! its timer from the new call; it does not keep the original deadline.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::models::BlockingConfig;
use crate::utils::{remaining_seconds, seconds_duration};

/// A single block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    #[serde(rename = "ip_address")]
    pub address: IpAddr,
    pub blocked_at: DateTime<Utc>,
    pub unblock_at: DateTime<Utc>,
}

/// A block as reported to callers, with its remaining lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveBlock {
    #[serde(flatten)]
    pub entry: BlockEntry,
    pub remaining_seconds: u64,
}

/// Outcome of a manual unblock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnblockOutcome {
    pub was_blocked: bool,
}

/// Blocklist with per-entry expiry
pub struct BlockingManager {
    block_duration: Duration,
    entries: Mutex<HashMap<IpAddr, BlockEntry>>,
}

impl BlockingManager {
    /// Create a new blocking manager
    pub fn new(config: &BlockingConfig) -> Self {
        Self {
            block_duration: seconds_duration(config.block_duration_secs),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Block `address` until `now + block_duration`.
    ///
    /// Blocking an address that is already blocked replaces its entry, so the
    /// deadline is measured from this call.
    pub fn block(&self, address: IpAddr, now: DateTime<Utc>) -> BlockEntry {
        let entry = BlockEntry {
            address,
            blocked_at: now,
            unblock_at: now
                .checked_add_signed(self.block_duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.lock().insert(address, entry.clone());
        info!("Blocked {} until {}", address, entry.unblock_at.to_rfc3339());
        entry
    }

    /// Whether `address` is blocked at `now`. Removes the entry if it has expired.
    pub fn is_blocked(&self, address: IpAddr, now: DateTime<Utc>) -> bool {
        let mut entries = self.lock();
        match entries.get(&address) {
            Some(entry) if now < entry.unblock_at => true,
            Some(_) => {
                entries.remove(&address);
                info!("Block on {} expired", address);
                false
            }
            None => false,
        }
    }

    /// Remove a block regardless of its remaining lifetime
    pub fn unblock(&self, address: IpAddr) -> UnblockOutcome {
        let was_blocked = self.lock().remove(&address).is_some();
        if was_blocked {
            info!("Unblocked {}", address);
        }
        UnblockOutcome { was_blocked }
    }

    /// Active blocks at `now`, nearest expiry first (ties broken by address).
    /// Expired entries are dropped as a side effect.
    pub fn active_entries(&self, now: DateTime<Utc>) -> Vec<ActiveBlock> {
        let mut entries = self.lock();
        entries.retain(|_, entry| now < entry.unblock_at);

        let mut active: Vec<ActiveBlock> = entries
            .values()
            .map(|entry| ActiveBlock {
                entry: entry.clone(),
                remaining_seconds: remaining_seconds(entry.unblock_at, now),
            })
            .collect();
        active.sort_by(|a, b| {
            a.entry
                .unblock_at
                .cmp(&b.entry.unblock_at)
                .then_with(|| a.entry.address.cmp(&b.entry.address))
        });
        active
    }

    /// Remove every expired entry and return how many were removed
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|address, entry| {
            let keep = now < entry.unblock_at;
            if !keep {
                info!("Auto-unblocking expired {}", address);
            }
            keep
        });
        before - entries.len()
    }

    /// Drop every block
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, BlockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(secs: u64) -> BlockingManager {
        BlockingManager::new(&BlockingConfig {
            block_duration_secs: secs,
        })
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_block_and_expire() {
        let blocker = manager(600);
        let ip = addr("10.0.0.5");
        let now = Utc::now();

        let entry = blocker.block(ip, now);
        assert_eq!(entry.unblock_at - entry.blocked_at, Duration::seconds(600));
        assert!(blocker.is_blocked(ip, now + Duration::seconds(599)));

        assert!(!blocker.is_blocked(ip, now + Duration::seconds(600)));
        assert!(blocker.active_entries(now).is_empty());
    }

    #[test]
    fn test_reblock_extends_deadline() {
        let blocker = manager(600);
        let ip = addr("10.0.0.5");
        let first = Utc::now();
        let second = first + Duration::seconds(100);

        blocker.block(ip, first);
        let entry = blocker.block(ip, second);
        assert_eq!(entry.unblock_at, second + Duration::seconds(600));
        assert!(blocker.is_blocked(ip, first + Duration::seconds(650)));
    }

    #[test]
    fn test_manual_unblock() {
        let blocker = manager(600);
        let ip = addr("10.0.0.5");
        let now = Utc::now();

        blocker.block(ip, now);
        assert!(blocker.unblock(ip).was_blocked);
        assert!(!blocker.is_blocked(ip, now));
        assert!(!blocker.unblock(ip).was_blocked);
    }

    #[test]
    fn test_active_entries_order() {
        let blocker = manager(60);
        let now = Utc::now();
        blocker.block(addr("10.0.0.9"), now + Duration::seconds(10));
        blocker.block(addr("10.0.0.3"), now);
        blocker.block(addr("10.0.0.1"), now);

        let active = blocker.active_entries(now + Duration::seconds(5));
        let order: Vec<IpAddr> = active.iter().map(|block| block.entry.address).collect();
        assert_eq!(order, vec![addr("10.0.0.1"), addr("10.0.0.3"), addr("10.0.0.9")]);
        assert_eq!(active[0].remaining_seconds, 55);
        assert_eq!(active[2].remaining_seconds, 65);
    }

    #[test]
    fn test_sweep_expired() {
        let blocker = manager(60);
        let now = Utc::now();
        blocker.block(addr("10.0.0.1"), now);
        blocker.block(addr("10.0.0.2"), now + Duration::seconds(30));

        assert_eq!(blocker.sweep_expired(now + Duration::seconds(61)), 1);
        assert_eq!(blocker.active_entries(now + Duration::seconds(61)).len(), 1);
    }

    #[test]
    fn test_unknown_address() {
        let blocker = manager(60);
        assert!(!blocker.is_blocked(addr("192.0.2.1"), Utc::now()));
    }

    #[test]
    fn test_huge_block_duration_does_not_overflow() {
        let blocker = manager(u64::MAX);
        let ip = addr("10.0.0.4");
        let now = Utc::now();
        let entry = blocker.block(ip, now);
        assert!(entry.unblock_at > now + Duration::days(365 * 99));
        assert!(blocker.is_blocked(ip, now + Duration::days(365)));
        assert_eq!(blocker.active_entries(now).len(), 1);
    }
}
