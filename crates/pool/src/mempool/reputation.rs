// This file is part of Quay.
//
// Quay is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Quay is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Quay.
// If not, see https://www.gnu.org/licenses/.

use std::collections::{HashMap, HashSet};

use alloy_primitives::Address;
use metrics::{Counter, Gauge};
use metrics_derive::Metrics;
use parking_lot::{Mutex, MutexGuard};
use quay_store::{codec, Partition, StorageResult, Store, WriteBatch};
use quay_types::{
    pool::{Reputation, ReputationEntry, ReputationStatus},
    Timestamp,
};
use serde::Deserialize;
use tracing::{info, warn};

/// Metadata key recording the time of the last decay pass
pub const LAST_DECAY_KEY: &[u8] = b"reputation/last_decay";

/// Thresholds on `ops_seen - ops_included`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReputationParams {
    /// Above this an entity is throttled
    pub throttling_slack: u64,
    /// Above this an entity is banned
    pub ban_slack: u64,
}

impl ReputationParams {
    /// Thresholds used by bundlers
    pub fn bundler_default() -> Self {
        Self {
            throttling_slack: 10,
            ban_slack: 50,
        }
    }
}

impl Default for ReputationParams {
    fn default() -> Self {
        Self::bundler_default()
    }
}

/// A counter update for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterChange {
    /// An operation naming the address was admitted
    Seen,
    /// An operation naming the address was included
    Included,
    /// An operation naming the address reverted on chain
    Reverted,
}

/// Holds the reputation write lock until a staged batch is written
#[must_use = "counters staged into a batch are only safe while this guard is held"]
pub struct StagedReputation<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Per-address reputation persisted in the `reputation` partition.
///
/// Status is derived on every read from the stored counters, the lists and any
/// manual ban. Counter read-modify-writes are serialized by one write lock.
#[derive(Debug)]
pub struct ReputationEngine {
    store: Store,
    params: ReputationParams,
    // Addresses that are always banned
    blocklist: HashSet<Address>,
    // Addresses that are always exempt from throttling and banning
    allowlist: HashSet<Address>,
    write_lock: Mutex<()>,
    metrics: ReputationMetrics,
}

impl ReputationEngine {
    /// Create an engine over `store`
    pub fn new(
        store: Store,
        params: ReputationParams,
        blocklist: HashSet<Address>,
        allowlist: HashSet<Address>,
    ) -> Self {
        Self {
            store,
            params,
            blocklist,
            allowlist,
            write_lock: Mutex::new(()),
            metrics: ReputationMetrics::default(),
        }
    }

    /// Thresholds in use
    pub fn params(&self) -> ReputationParams {
        self.params
    }

    /// Status of `address` at `now`.
    ///
    /// A failed read is logged and reported as `Ok` so a storage fault never
    /// bans anyone.
    pub fn status_of(&self, address: Address, now: Timestamp) -> ReputationStatus {
        if let Some(status) = self.listed_status(address) {
            return status;
        }
        match self.reputation_of(address) {
            Ok(entry) => self.derive_status(&entry, now),
            Err(error) => {
                warn!("Failed to read reputation of {address}, treating as ok: {error}");
                ReputationStatus::Ok
            }
        }
    }

    /// Stored counters of `address`, zeroed if never seen
    pub fn reputation_of(&self, address: Address) -> StorageResult<ReputationEntry> {
        match self.store.get(Partition::Reputation, address.as_slice())? {
            Some(raw) => codec::decode(Partition::Reputation, address.as_slice(), &raw),
            None => Ok(ReputationEntry::new(address)),
        }
    }

    /// Counters and derived status of `address`, degrading like [`Self::status_of`]
    pub fn reputation(&self, address: Address, now: Timestamp) -> Reputation {
        let entry = self.reputation_of(address).unwrap_or_else(|error| {
            warn!("Failed to read reputation of {address}: {error}");
            ReputationEntry::new(address)
        });
        Reputation {
            status: self
                .listed_status(address)
                .unwrap_or_else(|| self.derive_status(&entry, now)),
            entry,
        }
    }

    /// Count an admitted operation
    pub fn record_seen(&self, address: Address) -> StorageResult<()> {
        self.apply(&[(address, CounterChange::Seen)])
    }

    /// Count an included operation
    pub fn record_included(&self, address: Address) -> StorageResult<()> {
        self.apply(&[(address, CounterChange::Included)])
    }

    /// Count a reverted operation
    pub fn record_reverted(&self, address: Address) -> StorageResult<()> {
        self.apply(&[(address, CounterChange::Reverted)])
    }

    /// Ban `address` until `until`, whatever its counters say
    pub fn ban(&self, address: Address, until: Timestamp) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::new();
        let mut entry = self.load_for_write(address, &mut batch)?;
        entry.banned_until = Some(until);
        batch.put(
            Partition::Reputation,
            address.as_slice(),
            codec::encode(&entry)?,
        );
        self.store.write_batch(batch)?;
        info!("Banned {address} until {until}");
        Ok(())
    }

    /// Lift a manual ban. Counter-derived status still applies.
    pub fn unban(&self, address: Address) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::new();
        let mut entry = self.load_for_write(address, &mut batch)?;
        if entry.banned_until.take().is_none() && batch.is_empty() {
            return Ok(());
        }
        batch.put(
            Partition::Reputation,
            address.as_slice(),
            codec::encode(&entry)?,
        );
        self.store.write_batch(batch)?;
        info!("Unbanned {address}");
        Ok(())
    }

    /// Overwrite the counters of `address`
    pub fn set_reputation(
        &self,
        address: Address,
        ops_seen: u64,
        ops_included: u64,
    ) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::new();
        let mut entry = self.load_for_write(address, &mut batch)?;
        entry.ops_seen = ops_seen;
        entry.ops_included = ops_included;
        batch.put(
            Partition::Reputation,
            address.as_slice(),
            codec::encode(&entry)?,
        );
        self.store.write_batch(batch)
    }

    /// Every stored entry with its status at `now`
    pub fn dump(&self, now: Timestamp) -> StorageResult<Vec<Reputation>> {
        let snapshot = self.store.snapshot()?;
        let mut out = vec![];
        for item in snapshot.iterate(Partition::Reputation, &[])? {
            let (key, raw) = item?;
            let entry: ReputationEntry = match codec::decode(Partition::Reputation, &key, &raw) {
                Ok(entry) => entry,
                Err(error) => {
                    warn!("Skipping reputation record: {error}");
                    continue;
                }
            };
            out.push(Reputation {
                status: self
                    .listed_status(entry.address)
                    .unwrap_or_else(|| self.derive_status(&entry, now)),
                entry,
            });
        }
        Ok(out)
    }

    /// Halve every counter, rounding down, and record `now` as the decay time.
    ///
    /// Entries are kept even when all counters reach zero. Returns the number
    /// of entries visited.
    pub fn decay(&self, now: Timestamp) -> StorageResult<usize> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::new();
        let mut visited = 0;
        for item in self.store.iterate(Partition::Reputation, &[])? {
            let (key, raw) = item?;
            let mut entry: ReputationEntry = match codec::decode(Partition::Reputation, &key, &raw)
            {
                Ok(entry) => entry,
                Err(error) => {
                    warn!("Skipping reputation record during decay: {error}");
                    continue;
                }
            };
            entry.ops_seen /= 2;
            entry.ops_included /= 2;
            entry.ops_reverted /= 2;
            batch.put(Partition::Reputation, key.into_vec(), codec::encode(&entry)?);
            visited += 1;
        }
        batch.put(Partition::Metadata, LAST_DECAY_KEY, codec::encode(&now)?);
        self.store.write_batch(batch)?;

        self.metrics.decay_passes.increment(1);
        self.metrics.tracked_entities.set(visited as f64);
        info!("Decayed reputation of {visited} entities");
        Ok(visited)
    }

    /// Time of the last decay pass, if any
    pub fn last_decay(&self) -> StorageResult<Option<Timestamp>> {
        self.store
            .get(Partition::Metadata, LAST_DECAY_KEY)?
            .map(|raw| codec::decode(Partition::Metadata, LAST_DECAY_KEY, &raw))
            .transpose()
    }

    /// Folds counter changes into `batch` and returns the write lock guard.
    ///
    /// The caller must write `batch` before dropping the guard, otherwise a
    /// concurrent update can be lost. A corrupt record is replaced by fresh
    /// counters and its bytes are moved to the quarantine area in the same batch.
    pub fn stage(
        &self,
        batch: &mut WriteBatch,
        changes: &[(Address, CounterChange)],
    ) -> StorageResult<StagedReputation<'_>> {
        let guard = self.write_lock.lock();
        let mut entries: HashMap<Address, ReputationEntry> = HashMap::new();
        for (address, change) in changes {
            if !entries.contains_key(address) {
                let entry = self.load_for_write(*address, batch)?;
                entries.insert(*address, entry);
            }
            if let Some(entry) = entries.get_mut(address) {
                match change {
                    CounterChange::Seen => entry.ops_seen = entry.ops_seen.saturating_add(1),
                    CounterChange::Included => {
                        entry.ops_included = entry.ops_included.saturating_add(1)
                    }
                    CounterChange::Reverted => {
                        entry.ops_reverted = entry.ops_reverted.saturating_add(1)
                    }
                }
            }
        }
        for (address, entry) in entries {
            batch.put(
                Partition::Reputation,
                address.as_slice(),
                codec::encode(&entry)?,
            );
        }
        Ok(StagedReputation { _guard: guard })
    }

    fn apply(&self, changes: &[(Address, CounterChange)]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        let _staged = self.stage(&mut batch, changes)?;
        self.store.write_batch(batch)
    }

    fn load_for_write(
        &self,
        address: Address,
        batch: &mut WriteBatch,
    ) -> StorageResult<ReputationEntry> {
        let Some(raw) = self.store.get(Partition::Reputation, address.as_slice())? else {
            return Ok(ReputationEntry::new(address));
        };
        match codec::decode(Partition::Reputation, address.as_slice(), &raw) {
            Ok(entry) => Ok(entry),
            Err(error) => {
                warn!("Resetting corrupt reputation of {address}: {error}");
                batch.put(
                    Partition::Metadata,
                    Partition::Reputation.quarantine_key(address.as_slice()),
                    raw,
                );
                Ok(ReputationEntry::new(address))
            }
        }
    }

    fn listed_status(&self, address: Address) -> Option<ReputationStatus> {
        if self.blocklist.contains(&address) {
            Some(ReputationStatus::Banned)
        } else if self.allowlist.contains(&address) {
            Some(ReputationStatus::Ok)
        } else {
            None
        }
    }

    fn derive_status(&self, entry: &ReputationEntry, now: Timestamp) -> ReputationStatus {
        if entry.banned_until.is_some_and(|until| until > now) {
            return ReputationStatus::Banned;
        }
        let outstanding = entry.outstanding();
        if outstanding > self.params.ban_slack {
            ReputationStatus::Banned
        } else if outstanding > self.params.throttling_slack {
            ReputationStatus::Throttled
        } else {
            ReputationStatus::Ok
        }
    }
}

#[derive(Metrics)]
#[metrics(scope = "op_pool_reputation")]
struct ReputationMetrics {
    #[metric(describe = "the count of reputation decay passes.")]
    decay_passes: Counter,
    #[metric(describe = "the number of entities with stored reputation.")]
    tracked_entities: Gauge,
}
