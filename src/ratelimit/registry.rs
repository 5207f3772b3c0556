//! Per-caller limiter registry.
//!
//! The registry maps a caller to the set of limiters it has touched, one per
//! resource. Both levels are concurrent maps whose entry API performs the
//! insert-if-missing decision under a single shard lock, so racing first
//! accesses always agree on one limiter. Callers are evicted when the live
//! set grows past its capacity (least recently used first) or when their
//! entry outlives the configured time-to-live.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use super::bucket::TokenBucket;
use super::clock::{Clock, SystemClock};
use super::rate::Rate;
use crate::error::ConstructionError;

/// Default maximum number of tracked callers.
pub const DEFAULT_MAX_CALLERS: usize = 100_000;
/// Default time-to-live of a caller entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// A capacity scan frees `max_callers / EVICTION_HEADROOM` slots beyond the overflow.
const EVICTION_HEADROOM: usize = 20;

/// What refreshes a caller's time-to-live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Creating the caller, or adding or replacing one of its limiters
    #[default]
    AfterWrite,
    /// Any lookup for the caller
    AfterAccess,
}

/// How a requested rate interacts with an existing limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateUpdatePolicy {
    /// Keep the rate chosen when the limiter was created until it is evicted
    #[default]
    PinnedAtCreation,
    /// Replace the limiter whenever a call asks for a different rate
    FollowRequest,
}

/// Sizing and expiry settings for a [`LimiterRegistry`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Maximum number of callers held at once
    pub max_callers: usize,
    /// Time-to-live of a caller entry
    pub ttl: Duration,
    /// What refreshes the time-to-live
    pub expiry: ExpiryPolicy,
    /// Whether later calls may change an existing limiter's rate
    pub rate_update: RateUpdatePolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_callers: DEFAULT_MAX_CALLERS,
            ttl: DEFAULT_TTL,
            expiry: ExpiryPolicy::default(),
            rate_update: RateUpdatePolicy::default(),
        }
    }
}

/// The limiter bound to one (caller, resource) pair.
///
/// Immutable once built. An unlimited entry carries no bucket.
#[derive(Debug)]
pub struct LimiterEntry {
    rate: Rate,
    bucket: Option<TokenBucket>,
}

impl LimiterEntry {
    fn new(rate: Rate, clock: &Arc<dyn Clock>) -> Result<Self, ConstructionError> {
        let bucket = match rate {
            Rate::PerSecond(qps) if qps != 0.0 => {
                Some(TokenBucket::with_clock(qps, Arc::clone(clock))?)
            }
            _ => None,
        };
        Ok(Self { rate, bucket })
    }

    /// The rate recorded when this entry was created.
    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// The backing bucket, absent for unlimited entries.
    pub fn bucket(&self) -> Option<&TokenBucket> {
        self.bucket.as_ref()
    }
}

/// Per-caller state: the resource map plus eviction bookkeeping.
struct CallerSlot {
    resources: DashMap<String, Arc<LimiterEntry>>,
    /// Nanoseconds since the registry epoch at the last TTL refresh
    refreshed_at: AtomicU64,
    /// Recency sequence number for LRU ordering
    last_access: AtomicU64,
}

impl CallerSlot {
    fn new(now: u64, seq: u64) -> Self {
        Self {
            resources: DashMap::new(),
            refreshed_at: AtomicU64::new(now),
            last_access: AtomicU64::new(seq),
        }
    }
}

/// Snapshot of registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Callers currently held (including any not yet swept)
    pub callers: usize,
    /// Caller entries created
    pub callers_created: u64,
    /// Limiter entries created
    pub limiters_created: u64,
    /// Callers dropped to stay within capacity
    pub capacity_evictions: u64,
    /// Full scans run to make room for new callers
    pub capacity_scans: u64,
    /// Callers dropped because their TTL elapsed
    pub expirations: u64,
    /// Callers dropped through [`LimiterRegistry::remove`]
    pub removals: u64,
}

#[derive(Default)]
struct Counters {
    callers_created: AtomicU64,
    limiters_created: AtomicU64,
    capacity_evictions: AtomicU64,
    capacity_scans: AtomicU64,
    expirations: AtomicU64,
    removals: AtomicU64,
}

/// Bounded, time-expiring store of per-caller limiters.
///
/// Thread-safe; share it behind an `Arc`.
pub struct LimiterRegistry {
    callers: DashMap<String, Arc<CallerSlot>>,
    settings: RegistrySettings,
    clock: Arc<dyn Clock>,
    epoch: Instant,
    /// Source of LRU sequence numbers
    sequence: AtomicU64,
    /// Held by the insert running a capacity scan
    eviction: Mutex<()>,
    counters: Counters,
}

impl LimiterRegistry {
    /// Create a registry with the given settings and the system clock.
    pub fn new(settings: RegistrySettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock::new()))
    }

    /// Create a registry reading time from the given clock.
    pub fn with_clock(settings: RegistrySettings, clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self {
            callers: DashMap::new(),
            settings,
            clock,
            epoch,
            sequence: AtomicU64::new(0),
            eviction: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// The settings this registry was built with.
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Resolve the limiter for a (caller, resource) pair, creating it on first access.
    ///
    /// `requested` is only used when the entry has to be built, unless the
    /// registry follows requested rates. On error nothing is cached.
    pub fn get_or_create(
        &self,
        caller: &str,
        resource: &str,
        requested: Rate,
    ) -> Result<Arc<LimiterEntry>, ConstructionError> {
        if resource.is_empty() {
            return Err(ConstructionError::EmptyResource);
        }
        if let Rate::PerSecond(qps) = requested {
            // Reject before any caller slot is created.
            if qps != 0.0 {
                TokenBucket::stable_interval(qps, self.clock.now())?;
            }
        }

        let now = self.now_nanos();
        let (slot, inserted) = self.caller_slot(caller, now);
        if inserted {
            self.enforce_capacity();
        }

        let (entry, written) = self.resource_entry(&slot, caller, resource, requested)?;
        if written || self.settings.expiry == ExpiryPolicy::AfterAccess {
            slot.refreshed_at.store(now, Ordering::Relaxed);
        }
        Ok(entry)
    }

    /// Look up an existing limiter without creating anything.
    pub fn get(&self, caller: &str, resource: &str) -> Option<Arc<LimiterEntry>> {
        let now = self.now_nanos();
        let slot = self.callers.get(caller).map(|slot| Arc::clone(slot.value()))?;
        if self.is_expired(&slot, now) {
            return None;
        }
        slot.resources.get(resource).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop every limiter for a caller. Returns whether the caller was present.
    pub fn remove(&self, caller: &str) -> bool {
        let removed = self.callers.remove(caller).is_some();
        if removed {
            self.counters.removals.fetch_add(1, Ordering::Relaxed);
            info!(caller = %caller, "Removed caller from limiter registry");
        }
        removed
    }

    /// Whether a live (unexpired) entry exists for the caller.
    pub fn contains(&self, caller: &str) -> bool {
        let now = self.now_nanos();
        self.callers
            .get(caller)
            .map(|slot| !self.is_expired(slot.value(), now))
            .unwrap_or(false)
    }

    /// Number of resources tracked for a caller.
    pub fn resource_count(&self, caller: &str) -> usize {
        self.callers
            .get(caller)
            .map(|slot| slot.resources.len())
            .unwrap_or(0)
    }

    /// Number of callers currently held.
    pub fn len(&self) -> usize {
        self.callers.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.callers.clear();
    }

    /// Remove every caller whose TTL has elapsed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.now_nanos();
        let before = self.callers.len();
        self.callers.retain(|_, slot| !self.is_expired(slot, now));
        let removed = before.saturating_sub(self.callers.len());
        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed = removed, "Swept expired callers");
        }
        removed
    }

    /// Run [`sweep_expired`](Self::sweep_expired) on a tokio task every `interval`.
    ///
    /// The task stops once the registry has no other owners.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.sweep_expired();
                    }
                    None => break,
                }
            }
            debug!("Registry sweeper stopped");
        })
    }

    /// Current counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            callers: self.callers.len(),
            callers_created: self.counters.callers_created.load(Ordering::Relaxed),
            limiters_created: self.counters.limiters_created.load(Ordering::Relaxed),
            capacity_evictions: self.counters.capacity_evictions.load(Ordering::Relaxed),
            capacity_scans: self.counters.capacity_scans.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            removals: self.counters.removals.load(Ordering::Relaxed),
        }
    }

    /// Get or create the caller's slot. The bool is true when a new slot was inserted.
    fn caller_slot(&self, caller: &str, now: u64) -> (Arc<CallerSlot>, bool) {
        // Read-lock fast path for live callers.
        if let Some(slot) = self.callers.get(caller) {
            if !self.is_expired(slot.value(), now) {
                slot.last_access.store(self.next_seq(), Ordering::Relaxed);
                return (Arc::clone(slot.value()), false);
            }
        }

        match self.callers.entry(caller.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get(), now) {
                    let slot = Arc::new(CallerSlot::new(now, self.next_seq()));
                    occupied.insert(Arc::clone(&slot));
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    self.counters.callers_created.fetch_add(1, Ordering::Relaxed);
                    debug!(caller = %caller, "Caller entry expired, recreating");
                    (slot, false)
                } else {
                    occupied
                        .get()
                        .last_access
                        .store(self.next_seq(), Ordering::Relaxed);
                    (Arc::clone(occupied.get()), false)
                }
            }
            Entry::Vacant(vacant) => {
                let slot = Arc::new(CallerSlot::new(now, self.next_seq()));
                vacant.insert(Arc::clone(&slot));
                self.counters.callers_created.fetch_add(1, Ordering::Relaxed);
                trace!(caller = %caller, "Created caller entry");
                (slot, true)
            }
        }
    }

    /// Get or create the limiter for a resource. The bool is true when the map was written.
    fn resource_entry(
        &self,
        slot: &CallerSlot,
        caller: &str,
        resource: &str,
        requested: Rate,
    ) -> Result<(Arc<LimiterEntry>, bool), ConstructionError> {
        if let Some(entry) = slot.resources.get(resource) {
            if !self.needs_replacement(entry.value(), requested) {
                return Ok((Arc::clone(entry.value()), false));
            }
        }

        match slot.resources.entry(resource.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !self.needs_replacement(occupied.get(), requested) {
                    return Ok((Arc::clone(occupied.get()), false));
                }
                let entry = self.build_entry(caller, resource, requested)?;
                occupied.insert(Arc::clone(&entry));
                Ok((entry, true))
            }
            Entry::Vacant(vacant) => {
                let entry = self.build_entry(caller, resource, requested)?;
                vacant.insert(Arc::clone(&entry));
                Ok((entry, true))
            }
        }
    }

    fn build_entry(
        &self,
        caller: &str,
        resource: &str,
        rate: Rate,
    ) -> Result<Arc<LimiterEntry>, ConstructionError> {
        let entry = LimiterEntry::new(rate, &self.clock)?;
        self.counters.limiters_created.fetch_add(1, Ordering::Relaxed);
        debug!(
            caller = %caller,
            resource = %resource,
            rate = %rate,
            "Creating new limiter"
        );
        Ok(Arc::new(entry))
    }

    fn needs_replacement(&self, entry: &LimiterEntry, requested: Rate) -> bool {
        self.settings.rate_update == RateUpdatePolicy::FollowRequest && entry.rate != requested
    }

    /// Bring the caller count back under capacity.
    ///
    /// Expired callers are dropped first. Live callers are then evicted least
    /// recently used first until the count is down to a low-water mark below
    /// `max_callers`, so one scan makes room for many later inserts.
    fn enforce_capacity(&self) {
        let max = self.settings.max_callers;
        if self.callers.len() <= max {
            return;
        }

        // An insert that finds a scan in progress relies on it to make room.
        let Some(_guard) = self.eviction.try_lock() else {
            return;
        };
        if self.callers.len() <= max {
            return;
        }
        self.counters.capacity_scans.fetch_add(1, Ordering::Relaxed);

        let now = self.now_nanos();
        let mut expired = Vec::new();
        let mut candidates: Vec<(u64, String)> = Vec::with_capacity(self.callers.len());
        for slot in self.callers.iter() {
            if self.is_expired(slot.value(), now) {
                expired.push(slot.key().clone());
            } else {
                candidates.push((slot.last_access.load(Ordering::Relaxed), slot.key().clone()));
            }
        }

        let mut swept = 0u64;
        for caller in expired {
            let removed = self
                .callers
                .remove_if(&caller, |_, slot| self.is_expired(slot, now))
                .is_some();
            if removed {
                swept += 1;
            }
        }
        if swept > 0 {
            self.counters.expirations.fetch_add(swept, Ordering::Relaxed);
            debug!(removed = swept, "Swept expired callers over capacity");
        }

        let low_water = max - max / EVICTION_HEADROOM;
        let overflow = self
            .callers
            .len()
            .saturating_sub(low_water)
            .min(candidates.len());
        if overflow == 0 {
            return;
        }
        if overflow < candidates.len() {
            candidates.select_nth_unstable(overflow);
        }

        let mut evicted = 0u64;
        for (seq, caller) in candidates.into_iter().take(overflow) {
            // Skip callers that were touched after the scan.
            let removed = self
                .callers
                .remove_if(&caller, |_, slot| {
                    slot.last_access.load(Ordering::Relaxed) == seq
                })
                .is_some();
            if removed {
                evicted += 1;
                trace!(caller = %caller, "Evicted caller over capacity");
            }
        }

        if evicted > 0 {
            self.counters
                .capacity_evictions
                .fetch_add(evicted, Ordering::Relaxed);
            debug!(
                evicted = evicted,
                max_callers = max,
                low_water = low_water,
                "Enforced registry capacity"
            );
        }
    }

    fn is_expired(&self, slot: &CallerSlot, now: u64) -> bool {
        let refreshed = slot.refreshed_at.load(Ordering::Relaxed);
        now.saturating_sub(refreshed) >= self.ttl_nanos()
    }

    fn ttl_nanos(&self) -> u64 {
        u64::try_from(self.settings.ttl.as_nanos()).unwrap_or(u64::MAX)
    }

    fn now_nanos(&self) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(self.epoch);
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}
