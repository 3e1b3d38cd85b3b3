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

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use alloy_primitives::{hex, Address, B256, U256};
use metrics::{Counter, Gauge};
use metrics_derive::Metrics;
use parking_lot::MutexGuard;
use quay_store::{codec, Partition, StorageError, StorageResult, Store, WriteBatch};
use quay_types::{
    aggregator::SchemeDetector,
    pool::{EntryStatus, OperationOutcome, PoolEntry, PoolStats, ReputationStatus, Transition},
    Entity, Timestamp, UserOperation, UserOperationId,
};
use tracing::{debug, info, warn};

use super::{
    locks::StripedLocks,
    policy::{EntryOrdering, FeeBumpPolicy, ReplacementPolicy},
    reputation::{CounterChange, ReputationEngine},
    PoolConfig,
};
use crate::error::{MempoolError, MempoolResult};

const LOCK_STRIPES: usize = 256;

const ENTRY_PARTITIONS: [Partition; 4] = [
    Partition::Pending,
    Partition::Submitted,
    Partition::Included,
    Partition::Failed,
];

/// The operation pool.
///
/// All state lives in the store. Entries move between the `pending`,
/// `submitted`, `included` and `failed` partitions and every move is one
/// atomic batch. Per-sender striped locks serialize everything touching a
/// sender's slots. Locks are taken sender, then throttled entity, then
/// transaction, then the reputation write lock.
pub struct OpPool {
    store: Store,
    config: PoolConfig,
    reputation: Arc<ReputationEngine>,
    replacement: Arc<dyn ReplacementPolicy>,
    scheme_detector: Option<Arc<dyn SchemeDetector>>,
    sender_locks: StripedLocks,
    entity_locks: StripedLocks,
    tx_locks: StripedLocks,
    // Reserved or occupied pending slots. Only ever adjusted by deltas.
    pending_count: AtomicUsize,
    metrics: PoolMetrics,
}

impl std::fmt::Debug for OpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpPool")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("replacement", &self.replacement)
            .field("pending_count", &self.pending_count)
            .finish_non_exhaustive()
    }
}

// Sender and transaction stripes held while a bundle transaction's entries move
struct TxLock<'a> {
    _senders: Vec<MutexGuard<'a, ()>>,
    _tx: MutexGuard<'a, ()>,
    hashes: Vec<B256>,
}

impl OpPool {
    /// Open a pool over `store`, with a reputation engine over the same store
    pub fn new(store: Store, config: PoolConfig) -> MempoolResult<Self> {
        let reputation = Arc::new(ReputationEngine::new(
            store.clone(),
            config.reputation,
            config.blocklist.clone(),
            config.allowlist.clone(),
        ));
        Self::with_reputation(store, config, reputation)
    }

    /// Open a pool sharing an existing reputation engine
    pub fn with_reputation(
        store: Store,
        config: PoolConfig,
        reputation: Arc<ReputationEngine>,
    ) -> MempoolResult<Self> {
        let pending = store.count(Partition::Pending)?;
        let metrics = PoolMetrics::default();
        metrics.pending.set(pending as f64);
        info!(
            "Opened op pool for entry point {} on chain {} with {pending} pending operations",
            config.entry_point, config.chain_id
        );
        Ok(Self {
            replacement: Arc::new(FeeBumpPolicy::new(
                config.min_replacement_fee_increase_percentage,
            )),
            store,
            config,
            reputation,
            scheme_detector: None,
            sender_locks: StripedLocks::new(LOCK_STRIPES),
            entity_locks: StripedLocks::new(LOCK_STRIPES),
            tx_locks: StripedLocks::new(LOCK_STRIPES),
            pending_count: AtomicUsize::new(pending),
            metrics,
        })
    }

    /// Replace the default fee bump replacement policy
    pub fn with_replacement_policy(mut self, policy: Arc<dyn ReplacementPolicy>) -> Self {
        self.replacement = policy;
        self
    }

    /// Attribute aggregators to operations by signature shape
    pub fn with_scheme_detector(mut self, detector: Arc<dyn SchemeDetector>) -> Self {
        self.scheme_detector = Some(detector);
        self
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The reputation engine the pool checks and updates
    pub fn reputation(&self) -> &Arc<ReputationEngine> {
        &self.reputation
    }

    /// Admit `uo` into the pool, returning its hash
    pub fn submit(&self, uo: UserOperation) -> MempoolResult<B256> {
        self.submit_at(uo, Timestamp::now())
    }

    /// [`Self::submit`] with an explicit admission time.
    ///
    /// A full pool is swept once before the operation is turned away, so
    /// expired entries waiting for the maintenance task do not hold slots.
    pub fn submit_at(&self, uo: UserOperation, now: Timestamp) -> MempoolResult<B256> {
        let sender = uo.sender;
        let nonce = uo.nonce;
        let result = match self.try_submit(&uo, now) {
            Err(MempoolError::PoolFull(max)) => match self.sweep_expired(now) {
                Ok(0) => Err(MempoolError::PoolFull(max)),
                Ok(_) => self.try_submit(&uo, now),
                Err(error) => Err(error),
            },
            result => result,
        };
        match result {
            Ok(hash) => {
                debug!("Accepted operation {hash} from {sender} with nonce {nonce}");
                self.metrics.ops_added.increment(1);
                Ok(hash)
            }
            Err(error) => {
                debug!(
                    "Rejected operation from {sender} with nonce {nonce}: {}",
                    error.reason_code()
                );
                self.metrics.ops_rejected.increment(1);
                Err(error)
            }
        }
    }

    fn try_submit(&self, uo: &UserOperation, now: Timestamp) -> MempoolResult<B256> {
        uo.validate_shape()?;

        let hash = uo.hash(self.config.entry_point, self.config.chain_id);
        let id = uo.id();
        let _sender_guard = self.sender_locks.lock(uo.sender.as_slice());

        // an expired copy of the same operation is evicted like any expired occupant
        let stale = match self.find(hash)? {
            Some(known) if known.status == EntryStatus::Pending && known.is_expired(now) => {
                Some(known)
            }
            Some(_) => return Err(MempoolError::OperationAlreadyKnown),
            None => None,
        };

        let mut replaced = None;
        if let Some(existing) = self.slot_entry(&id)? {
            match existing.status {
                EntryStatus::Included => {
                    return Err(MempoolError::NonceAlreadyUsed(id.sender, id.nonce))
                }
                EntryStatus::Submitted => {
                    return Err(MempoolError::OperationInFlight(existing.hash))
                }
                EntryStatus::Pending => replaced = Some(existing),
                EntryStatus::Failed => {}
            }
        }
        if replaced.is_none() {
            replaced = stale;
        }

        let aggregator = self
            .scheme_detector
            .as_ref()
            .and_then(|detector| detector.detect_scheme(&uo.signature));
        let entry =
            PoolEntry::new_pending(uo.clone(), hash, aggregator, now, self.config.entry_ttl);
        let entities = entry.entities();
        let replaced_hash = replaced.as_ref().map(|r| r.hash);

        let mut throttled = vec![];
        for entity in &entities {
            match self.reputation.status_of(entity.address, now) {
                ReputationStatus::Banned => return Err(MempoolError::EntityBanned(*entity)),
                ReputationStatus::Throttled => throttled.push(*entity),
                ReputationStatus::Ok => {}
            }
        }
        // held until the admission is written so concurrent senders cannot
        // both take a throttled entity's last slot
        let _entity_guards = self
            .entity_locks
            .lock_many(throttled.iter().map(|e| e.address.as_slice()));
        for entity in &throttled {
            let pending = self.pending_naming(entity, replaced_hash, now)?;
            if pending >= self.config.throttled_entity_mempool_count {
                return Err(MempoolError::EntityThrottled(*entity));
            }
        }

        // an expired occupant is evicted without a fee bump
        if let Some(existing) = replaced.as_ref().filter(|e| !e.is_expired(now)) {
            if !self.replacement.may_replace(&existing.uo, &entry.uo) {
                return Err(MempoolError::ReplacementUnderpriced(
                    existing.uo.max_priority_fee_per_gas,
                    existing.uo.max_fee_per_gas,
                ));
            }
        }

        let sender_pending = self.sender_pending_count(id.sender, replaced_hash, now)?;
        if sender_pending >= self.config.same_sender_mempool_count {
            return Err(MempoolError::MaxOperationsReached(
                self.config.same_sender_mempool_count,
                Entity::account(id.sender),
            ));
        }

        // a replacement reuses its slot's reservation
        let reserved = replaced.is_none();
        if reserved {
            let max = self.config.max_pool_size;
            self.pending_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                    (count < max).then_some(count + 1)
                })
                .map_err(|_| MempoolError::PoolFull(max))?;
        }

        let result = self.write_admission(&entry, &id, replaced_hash, &entities);
        if let Err(error) = result {
            if reserved {
                self.release_pending(1);
            }
            return Err(error);
        }

        if let Some(old) = replaced_hash {
            info!("Operation {hash} replaced {old} for {} nonce {}", id.sender, id.nonce);
            self.metrics.ops_replaced.increment(1);
        }
        self.update_pending_gauge();
        Ok(hash)
    }

    fn write_admission(
        &self,
        entry: &PoolEntry,
        id: &UserOperationId,
        replaced: Option<B256>,
        entities: &[Entity],
    ) -> MempoolResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            Partition::Pending,
            entry.hash.as_slice(),
            codec::encode(entry)?,
        );
        batch.put(
            Partition::SenderIndex,
            id.to_key().to_vec(),
            entry.hash.as_slice(),
        );
        if let Some(old) = replaced.filter(|old| *old != entry.hash) {
            batch.delete(Partition::Pending, old.as_slice());
        }
        let changes: Vec<_> = entities
            .iter()
            .map(|entity| (entity.address, CounterChange::Seen))
            .collect();
        let _staged = self.reputation.stage(&mut batch, &changes)?;
        self.store.write_batch(batch)?;
        Ok(())
    }

    /// Move a pending operation into a submitted bundle transaction
    pub fn mark_submitted(&self, hash: B256, tx_hash: B256) -> MempoolResult<Transition> {
        self.mark_submitted_batch(&[hash], tx_hash)
    }

    /// Move several pending operations into one submitted bundle transaction.
    ///
    /// Hashes that are not pending are skipped; `NotFound` if none was.
    pub fn mark_submitted_batch(
        &self,
        hashes: &[B256],
        tx_hash: B256,
    ) -> MempoolResult<Transition> {
        let mut senders = vec![];
        for hash in hashes {
            if let Some(entry) = self.load_lenient(Partition::Pending, *hash)? {
                senders.push(entry.uo.sender);
            }
        }
        if senders.is_empty() {
            return Ok(Transition::NotFound);
        }

        // an entry still pending under its sender's lock has the sender read above
        let _sender_guards = self
            .sender_locks
            .lock_many(senders.iter().map(|s| s.as_slice()));
        let _tx_guard = self.tx_locks.lock(tx_hash.as_slice());

        let now = Timestamp::now();
        let mut batch = WriteBatch::new();
        let mut mapping = self.read_tx_mapping(tx_hash)?.unwrap_or_default();
        let mut moved = 0;
        for hash in hashes {
            let Some(mut entry) = self.load_lenient(Partition::Pending, *hash)? else {
                continue;
            };
            if mapping.contains(hash) {
                continue;
            }
            entry.status = EntryStatus::Submitted;
            entry.transaction_hash = Some(tx_hash);
            entry.last_updated = now;
            batch.delete(Partition::Pending, hash.as_slice());
            batch.put(
                Partition::Submitted,
                hash.as_slice(),
                codec::encode(&entry)?,
            );
            mapping.push(*hash);
            moved += 1;
        }
        if moved == 0 {
            return Ok(Transition::NotFound);
        }
        batch.put(
            Partition::TxMapping,
            tx_hash.as_slice(),
            encode_hashes(&mapping),
        );
        self.store.write_batch(batch)?;

        self.release_pending(moved);
        self.update_pending_gauge();
        self.metrics.ops_submitted.increment(moved as u64);
        info!("Marked {moved} operations submitted in transaction {tx_hash}");
        Ok(Transition::Applied(moved))
    }

    /// Settle every operation of a landed bundle transaction.
    ///
    /// Unknown transactions, including ones already settled, are `NotFound`.
    pub fn report_outcome(
        &self,
        tx_hash: B256,
        outcome: OperationOutcome,
    ) -> MempoolResult<Transition> {
        self.settle(tx_hash, outcome, None)
    }

    /// [`Self::report_outcome`], recording the block the transaction landed in
    pub fn report_outcome_in_block(
        &self,
        tx_hash: B256,
        outcome: OperationOutcome,
        block_number: u64,
    ) -> MempoolResult<Transition> {
        self.settle(tx_hash, outcome, Some(block_number))
    }

    fn settle(
        &self,
        tx_hash: B256,
        outcome: OperationOutcome,
        block_number: Option<u64>,
    ) -> MempoolResult<Transition> {
        let Some(lock) = self.lock_tx(tx_hash)? else {
            return Ok(Transition::NotFound);
        };

        let now = Timestamp::now();
        let terminal = outcome.status();
        let target = match outcome {
            OperationOutcome::Included => Partition::Included,
            OperationOutcome::Failed => Partition::Failed,
        };
        let change = match outcome {
            OperationOutcome::Included => CounterChange::Included,
            OperationOutcome::Failed => CounterChange::Reverted,
        };

        let mut batch = WriteBatch::new();
        let mut changes = vec![];
        let mut moved = 0;
        for hash in &lock.hashes {
            let Some(mut entry) = self.load_lenient(Partition::Submitted, *hash)? else {
                continue;
            };
            entry.status = terminal;
            entry.block_number = block_number;
            entry.last_updated = now;
            changes.extend(entry.entities().into_iter().map(|e| (e.address, change)));
            batch.delete(Partition::Submitted, hash.as_slice());
            batch.put(target, hash.as_slice(), codec::encode(&entry)?);
            moved += 1;
        }
        batch.delete(Partition::TxMapping, tx_hash.as_slice());
        let _staged = self.reputation.stage(&mut batch, &changes)?;
        self.store.write_batch(batch)?;

        match outcome {
            OperationOutcome::Included => self.metrics.ops_included.increment(moved as u64),
            OperationOutcome::Failed => self.metrics.ops_failed.increment(moved as u64),
        }
        info!("Transaction {tx_hash} settled {moved} operations as {outcome}");
        Ok(Transition::Applied(moved))
    }

    /// Fail operations that are pending or in flight, recording `reason`.
    ///
    /// For failures found off chain, such as a bundle that no longer
    /// simulates. Reputation counters are untouched. Hashes in neither
    /// partition are skipped; `NotFound` if none was moved.
    pub fn mark_failed(&self, hashes: &[B256], reason: &str) -> MempoolResult<Transition> {
        let mut seen = HashSet::new();
        let hashes: Vec<B256> = hashes.iter().copied().filter(|h| seen.insert(*h)).collect();

        let mut senders = vec![];
        for hash in &hashes {
            if let Some((_, entry)) = self.find_live(*hash)? {
                senders.push(entry.uo.sender);
            }
        }
        if senders.is_empty() {
            return Ok(Transition::NotFound);
        }
        let _sender_guards = self
            .sender_locks
            .lock_many(senders.iter().map(|s| s.as_slice()));

        let now = Timestamp::now();
        let mut batch = WriteBatch::new();
        let mut moved = 0;
        let mut from_pending = 0;
        for hash in &hashes {
            let Some((partition, mut entry)) = self.find_live(*hash)? else {
                continue;
            };
            // admitted after the senders were read, and not ours to move
            if !self
                .sender_locks
                .covers(senders.iter().map(|s| s.as_slice()), entry.uo.sender.as_slice())
            {
                continue;
            }
            entry.status = EntryStatus::Failed;
            entry.error = Some(reason.to_string());
            entry.last_updated = now;
            batch.delete(partition, hash.as_slice());
            batch.put(Partition::Failed, hash.as_slice(), codec::encode(&entry)?);
            moved += 1;
            if partition == Partition::Pending {
                from_pending += 1;
            }
        }
        if moved == 0 {
            return Ok(Transition::NotFound);
        }
        self.store.write_batch(batch)?;

        self.release_pending(from_pending);
        self.update_pending_gauge();
        self.metrics.ops_failed.increment(moved as u64);
        info!("Marked {moved} operations failed: {reason}");
        Ok(Transition::Applied(moved))
    }

    /// Return the operations of a dropped bundle transaction to `pending`.
    ///
    /// Expiry is unchanged, so a requeued operation does not live longer.
    pub fn revert_submitted(&self, tx_hash: B256) -> MempoolResult<Transition> {
        let Some(lock) = self.lock_tx(tx_hash)? else {
            return Ok(Transition::NotFound);
        };

        let now = Timestamp::now();
        let mut batch = WriteBatch::new();
        let mut moved = 0;
        for hash in &lock.hashes {
            let Some(mut entry) = self.load_lenient(Partition::Submitted, *hash)? else {
                continue;
            };
            entry.status = EntryStatus::Pending;
            entry.transaction_hash = None;
            entry.retry_count = entry.retry_count.saturating_add(1);
            entry.last_updated = now;
            batch.delete(Partition::Submitted, hash.as_slice());
            batch.put(Partition::Pending, hash.as_slice(), codec::encode(&entry)?);
            moved += 1;
        }
        batch.delete(Partition::TxMapping, tx_hash.as_slice());
        self.store.write_batch(batch)?;

        self.pending_count.fetch_add(moved, Ordering::AcqRel);
        self.update_pending_gauge();
        self.metrics.ops_requeued.increment(moved as u64);
        info!("Transaction {tx_hash} dropped, requeued {moved} operations");
        Ok(Transition::Applied(moved))
    }

    /// Delete expired pending entries and terminal entries past retention.
    ///
    /// Candidates come from a snapshot and are re-checked under their sender's
    /// lock before deletion. Corrupt records are quarantined. Returns the
    /// number of entries removed.
    pub fn sweep_expired(&self, now: Timestamp) -> MempoolResult<usize> {
        let mut candidates = vec![];
        let mut corrupt = vec![];
        {
            let snapshot = self.store.snapshot()?;
            for partition in ENTRY_PARTITIONS {
                for item in snapshot.iterate(partition, &[])? {
                    let (key, raw) = item?;
                    let entry: PoolEntry = match codec::decode(partition, &key, &raw) {
                        Ok(entry) => entry,
                        Err(StorageError::Corrupt(reason)) => {
                            warn!("Found corrupt record in {partition}: {reason}");
                            corrupt.push((partition, key));
                            continue;
                        }
                        Err(error) => return Err(error.into()),
                    };
                    if self.is_sweepable(partition, &entry, now) {
                        candidates.push((partition, entry.hash, entry.uo.sender));
                    }
                }
            }
        }

        for (partition, key) in corrupt {
            self.quarantine(partition, &key)?;
        }

        let mut removed = 0;
        let mut removed_pending = 0;
        for (partition, hash, sender) in candidates {
            let _guard = self.sender_locks.lock(sender.as_slice());
            let Some(entry) = self.load_lenient(partition, hash)? else {
                continue;
            };
            if !self.is_sweepable(partition, &entry, now) {
                continue;
            }
            let mut batch = WriteBatch::new();
            batch.delete(partition, hash.as_slice());
            self.unindex(&mut batch, &entry)?;
            self.store.write_batch(batch)?;
            removed += 1;
            if partition == Partition::Pending {
                removed_pending += 1;
            }
        }

        // admissions may hold reservations not yet written, so never overwrite the count
        self.release_pending(removed_pending);
        self.update_pending_gauge();
        if removed > 0 {
            self.metrics.ops_swept.increment(removed as u64);
            info!("Swept {removed} expired operations");
        }
        Ok(removed)
    }

    fn is_sweepable(&self, partition: Partition, entry: &PoolEntry, now: Timestamp) -> bool {
        match partition {
            Partition::Pending => entry.is_expired(now),
            Partition::Included | Partition::Failed => {
                entry.last_updated + self.config.terminal_retention <= now
            }
            _ => false,
        }
    }

    /// Unexpired pending entries in `order`, at most `limit` of them
    pub fn list_pending(
        &self,
        limit: usize,
        order: &dyn EntryOrdering,
    ) -> MempoolResult<Vec<PoolEntry>> {
        let mut entries = self.live_pending(Timestamp::now())?;
        entries.sort_by(|a, b| order.compare(a, b));
        entries.truncate(limit);
        Ok(entries)
    }

    /// As [`Self::list_pending`], skipping entries whose gas limit would push
    /// the running total past `max_gas`
    pub fn list_pending_with_gas(
        &self,
        limit: usize,
        max_gas: U256,
        order: &dyn EntryOrdering,
    ) -> MempoolResult<Vec<PoolEntry>> {
        let mut entries = self.live_pending(Timestamp::now())?;
        entries.sort_by(|a, b| order.compare(a, b));

        let mut gas = U256::ZERO;
        let mut out = vec![];
        for entry in entries {
            if out.len() >= limit {
                break;
            }
            let next = gas.saturating_add(entry.uo.total_gas_limit());
            if next > max_gas {
                continue;
            }
            gas = next;
            out.push(entry);
        }
        Ok(out)
    }

    fn live_pending(&self, now: Timestamp) -> MempoolResult<Vec<PoolEntry>> {
        let snapshot = self.store.snapshot()?;
        let mut entries = vec![];
        for item in snapshot.iterate(Partition::Pending, &[])? {
            let (key, raw) = item?;
            match codec::decode::<PoolEntry>(Partition::Pending, &key, &raw) {
                Ok(entry) if !entry.is_expired(now) => entries.push(entry),
                Ok(_) => {}
                Err(error) => warn!("Skipping pending record: {error}"),
            }
        }
        Ok(entries)
    }

    /// Look an operation up in every status partition
    pub fn get(&self, hash: B256) -> MempoolResult<Option<PoolEntry>> {
        Ok(self.find(hash)?)
    }

    /// Every indexed entry of `sender`, in nonce order
    pub fn get_by_sender(&self, sender: Address) -> MempoolResult<Vec<PoolEntry>> {
        let snapshot = self.store.snapshot()?;
        let mut hashes = vec![];
        for item in snapshot.iterate(Partition::SenderIndex, sender.as_slice())? {
            let (_, value) = item?;
            if value.len() == 32 {
                hashes.push(B256::from_slice(&value));
            }
        }
        drop(snapshot);

        let mut entries = vec![];
        for hash in hashes {
            if let Some(entry) = self.find(hash)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Drop a pending operation. Returns whether it was pending.
    pub fn remove(&self, hash: B256) -> MempoolResult<bool> {
        let Some(entry) = self.load_lenient(Partition::Pending, hash)? else {
            return Ok(false);
        };
        let _guard = self.sender_locks.lock(entry.uo.sender.as_slice());
        let Some(entry) = self.load_lenient(Partition::Pending, hash)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::new();
        batch.delete(Partition::Pending, hash.as_slice());
        self.unindex(&mut batch, &entry)?;
        self.store.write_batch(batch)?;
        self.release_pending(1);
        self.update_pending_gauge();
        info!("Removed operation {hash}");
        Ok(true)
    }

    /// Partition counts, distinct live entities and their total prefund
    pub fn stats(&self) -> MempoolResult<PoolStats> {
        let snapshot = self.store.snapshot()?;
        let mut senders = HashSet::new();
        let mut paymasters = HashSet::new();
        let mut total_prefund = U256::ZERO;
        for partition in [Partition::Pending, Partition::Submitted] {
            for item in snapshot.iterate(partition, &[])? {
                let (key, raw) = item?;
                let Ok(entry) = codec::decode::<PoolEntry>(partition, &key, &raw) else {
                    continue;
                };
                senders.insert(entry.uo.sender);
                if let Some(paymaster) = entry.uo.paymaster() {
                    paymasters.insert(paymaster);
                }
                total_prefund = total_prefund.saturating_add(entry.uo.max_gas_cost());
            }
        }
        Ok(PoolStats {
            pending: snapshot.count(Partition::Pending)?,
            submitted: snapshot.count(Partition::Submitted)?,
            included: snapshot.count(Partition::Included)?,
            failed: snapshot.count(Partition::Failed)?,
            unique_senders: senders.len(),
            unique_paymasters: paymasters.len(),
            total_prefund,
        })
    }

    /// Wipe every pool partition. Reputation is kept.
    pub fn clear(&self) -> MempoolResult<()> {
        // no admission holds an unwritten reservation while every sender is locked
        let _sender_guards = self.sender_locks.lock_all();
        for partition in ENTRY_PARTITIONS
            .into_iter()
            .chain([Partition::SenderIndex, Partition::TxMapping])
        {
            self.store.clear_partition(partition)?;
        }
        self.pending_count.store(0, Ordering::Release);
        self.update_pending_gauge();
        warn!("Cleared the op pool");
        Ok(())
    }

    /// Move a record to the quarantine area of `metadata`.
    ///
    /// Returns false if there was nothing under `key`.
    pub fn quarantine(&self, partition: Partition, key: &[u8]) -> MempoolResult<bool> {
        let Some(raw) = self.store.get(partition, key)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::new();
        batch.put(Partition::Metadata, partition.quarantine_key(key), raw);
        batch.delete(partition, key);
        self.store.write_batch(batch)?;
        if partition == Partition::Pending {
            self.release_pending(1);
            self.update_pending_gauge();
        }
        warn!("Quarantined record {} of {partition}", hex::encode(key));
        Ok(true)
    }

    fn find(&self, hash: B256) -> StorageResult<Option<PoolEntry>> {
        for partition in ENTRY_PARTITIONS {
            if let Some(raw) = self.store.get(partition, hash.as_slice())? {
                return codec::decode(partition, hash.as_slice(), &raw).map(Some);
            }
        }
        Ok(None)
    }

    // The entry and its partition, if pending or submitted
    fn find_live(&self, hash: B256) -> StorageResult<Option<(Partition, PoolEntry)>> {
        for partition in [Partition::Pending, Partition::Submitted] {
            if let Some(entry) = self.load_lenient(partition, hash)? {
                return Ok(Some((partition, entry)));
            }
        }
        Ok(None)
    }

    // Reads an entry, treating a corrupt record as absent. Sweeps quarantine it.
    fn load_lenient(&self, partition: Partition, hash: B256) -> StorageResult<Option<PoolEntry>> {
        let Some(raw) = self.store.get(partition, hash.as_slice())? else {
            return Ok(None);
        };
        match codec::decode(partition, hash.as_slice(), &raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(StorageError::Corrupt(reason)) => {
                warn!("Ignoring corrupt record in {partition}: {reason}");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn slot_entry(&self, id: &UserOperationId) -> StorageResult<Option<PoolEntry>> {
        let Some(value) = self.store.get(Partition::SenderIndex, &id.to_key())? else {
            return Ok(None);
        };
        if value.len() != 32 {
            return Err(StorageError::corrupt_record(
                Partition::SenderIndex,
                &id.to_key(),
                format!("expected a 32 byte hash, found {} bytes", value.len()),
            ));
        }
        let hash = B256::from_slice(&value);
        for partition in ENTRY_PARTITIONS {
            if let Some(entry) = self.load_lenient(partition, hash)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    // Removes the slot's index record if it still points at `entry`
    fn unindex(&self, batch: &mut WriteBatch, entry: &PoolEntry) -> StorageResult<()> {
        let key = entry.id().to_key();
        if self.store.get(Partition::SenderIndex, &key)?.as_deref() == Some(entry.hash.as_slice()) {
            batch.delete(Partition::SenderIndex, key.to_vec());
        }
        Ok(())
    }

    // Unexpired pending entries of `sender`, other than `exclude`
    fn sender_pending_count(
        &self,
        sender: Address,
        exclude: Option<B256>,
        now: Timestamp,
    ) -> StorageResult<usize> {
        let mut hashes = vec![];
        for item in self.store.iterate(Partition::SenderIndex, sender.as_slice())? {
            let (_, value) = item?;
            if value.len() == 32 {
                hashes.push(B256::from_slice(&value));
            }
        }
        let mut count = 0;
        for hash in hashes {
            if Some(hash) == exclude {
                continue;
            }
            if let Some(entry) = self.load_lenient(Partition::Pending, hash)? {
                if !entry.is_expired(now) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    // Unexpired pending entries naming `entity`, other than `exclude`
    fn pending_naming(
        &self,
        entity: &Entity,
        exclude: Option<B256>,
        now: Timestamp,
    ) -> StorageResult<usize> {
        let snapshot = self.store.snapshot()?;
        let mut count = 0;
        for item in snapshot.iterate(Partition::Pending, &[])? {
            let (key, raw) = item?;
            let Ok(entry) = codec::decode::<PoolEntry>(Partition::Pending, &key, &raw) else {
                continue;
            };
            if Some(entry.hash) != exclude
                && !entry.is_expired(now)
                && entry.entities().contains(entity)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    fn read_tx_mapping(&self, tx_hash: B256) -> StorageResult<Option<Vec<B256>>> {
        let Some(raw) = self.store.get(Partition::TxMapping, tx_hash.as_slice())? else {
            return Ok(None);
        };
        if raw.len() % 32 != 0 {
            return Err(StorageError::corrupt_record(
                Partition::TxMapping,
                tx_hash.as_slice(),
                format!("length {} is not a multiple of 32", raw.len()),
            ));
        }
        Ok(Some(raw.chunks_exact(32).map(B256::from_slice).collect()))
    }

    fn submitted_senders(&self, hashes: &[B256]) -> StorageResult<Vec<Address>> {
        let mut senders = vec![];
        for hash in hashes {
            if let Some(entry) = self.load_lenient(Partition::Submitted, *hash)? {
                senders.push(entry.uo.sender);
            }
        }
        Ok(senders)
    }

    // Locks the senders of a transaction's entries, then the transaction.
    // The mapping can grow between the unlocked read and the lock, so retry
    // until every sender read under the lock is covered.
    fn lock_tx(&self, tx_hash: B256) -> StorageResult<Option<TxLock<'_>>> {
        loop {
            let Some(hashes) = self.read_tx_mapping(tx_hash)? else {
                return Ok(None);
            };
            let senders = self.submitted_senders(&hashes)?;
            let sender_guards = self
                .sender_locks
                .lock_many(senders.iter().map(|s| s.as_slice()));
            let tx_guard = self.tx_locks.lock(tx_hash.as_slice());

            let Some(hashes) = self.read_tx_mapping(tx_hash)? else {
                return Ok(None);
            };
            let current = self.submitted_senders(&hashes)?;
            let covered = current.iter().all(|sender| {
                self.sender_locks
                    .covers(senders.iter().map(|s| s.as_slice()), sender.as_slice())
            });
            if covered {
                return Ok(Some(TxLock {
                    _senders: sender_guards,
                    _tx: tx_guard,
                    hashes,
                }));
            }
        }
    }

    fn release_pending(&self, n: usize) {
        let _ = self
            .pending_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(n))
            });
    }

    fn update_pending_gauge(&self) {
        self.metrics
            .pending
            .set(self.pending_count.load(Ordering::Acquire) as f64);
    }
}

fn encode_hashes(hashes: &[B256]) -> Vec<u8> {
    hashes.iter().flat_map(|h| h.0).collect()
}

#[derive(Metrics)]
#[metrics(scope = "op_pool")]
struct PoolMetrics {
    #[metric(describe = "the count of admitted ops.")]
    ops_added: Counter,
    #[metric(describe = "the count of rejected ops.")]
    ops_rejected: Counter,
    #[metric(describe = "the count of ops that replaced a pending op.")]
    ops_replaced: Counter,
    #[metric(describe = "the count of ops removed by sweeps.")]
    ops_swept: Counter,
    #[metric(describe = "the count of ops marked submitted.")]
    ops_submitted: Counter,
    #[metric(describe = "the count of ops included on chain.")]
    ops_included: Counter,
    #[metric(describe = "the count of ops that failed on chain.")]
    ops_failed: Counter,
    #[metric(describe = "the count of ops returned to pending after a dropped bundle.")]
    ops_requeued: Counter,
    #[metric(describe = "the number of pending ops.")]
    pending: Gauge,
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use alloy_primitives::Bytes;
    use quay_store::StoreConfig;
    use quay_types::aggregator::MockSchemeDetector;
    use tempfile::TempDir;

    use super::*;
    use crate::mempool::{ByFeePriority, ByFirstSeen};

    fn config() -> PoolConfig {
        PoolConfig {
            chain_id: 1337,
            ..Default::default()
        }
    }

    fn open(dir: &TempDir, config: PoolConfig) -> OpPool {
        let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
        OpPool::new(store, config).unwrap()
    }

    fn op(sender: u8, nonce: u64, priority_fee: u64, fee: u64) -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(sender),
            nonce: U256::from(nonce),
            call_gas_limit: U256::from(50_000),
            verification_gas_limit: U256::from(100_000),
            pre_verification_gas: U256::from(21_000),
            max_priority_fee_per_gas: U256::from(priority_fee),
            max_fee_per_gas: U256::from(fee),
            signature: Bytes::from(vec![7u8; 65]),
            ..Default::default()
        }
    }

    fn with_paymaster(mut uo: UserOperation, paymaster: Address) -> UserOperation {
        uo.paymaster_and_data = Bytes::from(paymaster.to_vec());
        uo
    }

    fn status(pool: &OpPool, hash: B256) -> Option<EntryStatus> {
        pool.get(hash).unwrap().map(|e| e.status)
    }

    #[test]
    fn accepts_new_operation() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let uo = op(1, 0, 100, 1000);

        let hash = pool.submit(uo.clone()).unwrap();
        assert_eq!(hash, uo.hash(pool.config().entry_point, 1337));

        let entry = pool.get(hash).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.uo, uo);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(
            pool.reputation().reputation_of(uo.sender).unwrap().ops_seen,
            1
        );
        assert_eq!(pool.stats().unwrap().pending, 1);
    }

    #[test]
    fn rejects_invalid_shape() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let mut uo = op(1, 0, 100, 1000);
        uo.signature = Bytes::new();
        assert!(matches!(
            pool.submit(uo),
            Err(MempoolError::Validation(_))
        ));
        assert_eq!(pool.stats().unwrap().pending, 0);
    }

    #[test]
    fn rejects_known_operation() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let uo = op(1, 0, 100, 1000);
        pool.submit(uo.clone()).unwrap();
        assert!(matches!(
            pool.submit(uo),
            Err(MempoolError::OperationAlreadyKnown)
        ));
    }

    #[test]
    fn replacement_underpriced() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let original = pool.submit(op(1, 0, 100, 1000)).unwrap();

        let err = pool.submit(op(1, 0, 105, 1100)).unwrap_err();
        assert!(matches!(
            err,
            MempoolError::ReplacementUnderpriced(p, f) if p == U256::from(100) && f == U256::from(1000)
        ));
        // both fees must rise
        assert!(pool.submit(op(1, 0, 200, 1050)).is_err());
        assert_eq!(status(&pool, original), Some(EntryStatus::Pending));
    }

    #[test]
    fn replacement_evicts_original() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let original = pool.submit(op(1, 0, 100, 1000)).unwrap();
        let replacement = pool.submit(op(1, 0, 110, 1100)).unwrap();

        assert_eq!(status(&pool, original), None);
        assert_eq!(status(&pool, replacement), Some(EntryStatus::Pending));
        let by_sender = pool.get_by_sender(Address::repeat_byte(1)).unwrap();
        assert_eq!(by_sender.len(), 1);
        assert_eq!(by_sender[0].hash, replacement);
        assert_eq!(pool.stats().unwrap().pending, 1);
    }

    #[test]
    fn submitted_then_included() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let uo = op(1, 0, 100, 1000);
        let hash = pool.submit(uo.clone()).unwrap();
        let tx = B256::repeat_byte(0xaa);

        assert_eq!(pool.mark_submitted(hash, tx).unwrap(), Transition::Applied(1));
        let entry = pool.get(hash).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Submitted);
        assert_eq!(entry.transaction_hash, Some(tx));

        assert_eq!(
            pool.report_outcome(tx, OperationOutcome::Included).unwrap(),
            Transition::Applied(1)
        );
        assert_eq!(status(&pool, hash), Some(EntryStatus::Included));
        let sender = pool.reputation().reputation_of(uo.sender).unwrap();
        assert_eq!(sender.ops_seen, 1);
        assert_eq!(sender.ops_included, 1);

        // confirmation sources repeat themselves
        assert_eq!(
            pool.report_outcome(tx, OperationOutcome::Included).unwrap(),
            Transition::NotFound
        );
        assert_eq!(
            pool.reputation().reputation_of(uo.sender).unwrap().ops_included,
            1
        );

        assert!(matches!(
            pool.submit(op(1, 0, 500, 5000)),
            Err(MempoolError::NonceAlreadyUsed(_, n)) if n == U256::ZERO
        ));
        assert_eq!(
            pool.stats().unwrap(),
            PoolStats {
                included: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn mark_submitted_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        assert_eq!(
            pool.mark_submitted(B256::repeat_byte(1), B256::repeat_byte(2))
                .unwrap(),
            Transition::NotFound
        );
        assert_eq!(
            pool.report_outcome(B256::repeat_byte(2), OperationOutcome::Failed)
                .unwrap(),
            Transition::NotFound
        );
    }

    #[test]
    fn slot_in_flight() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let hash = pool.submit(op(1, 0, 100, 1000)).unwrap();
        pool.mark_submitted(hash, B256::repeat_byte(3)).unwrap();

        let err = pool.submit(op(1, 0, 1000, 10000)).unwrap_err();
        assert!(matches!(err, MempoolError::OperationInFlight(h) if h == hash));
        assert!(err.is_retryable());
        // the slot no longer counts against the sender
        pool.submit(op(1, 1, 100, 1000)).unwrap();
    }

    #[test]
    fn failed_slot_can_be_reused() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let uo = op(1, 0, 100, 1000);
        let hash = pool.submit(uo.clone()).unwrap();
        let tx = B256::repeat_byte(4);
        pool.mark_submitted(hash, tx).unwrap();
        pool.report_outcome(tx, OperationOutcome::Failed).unwrap();

        assert_eq!(status(&pool, hash), Some(EntryStatus::Failed));
        assert_eq!(
            pool.reputation().reputation_of(uo.sender).unwrap().ops_reverted,
            1
        );
        let retry = pool.submit(op(1, 0, 100, 1001)).unwrap();
        assert_eq!(status(&pool, retry), Some(EntryStatus::Pending));
        assert_eq!(status(&pool, hash), Some(EntryStatus::Failed));
    }

    #[test]
    fn batch_submission_and_revert() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let a = pool.submit(op(1, 0, 100, 1000)).unwrap();
        let b = pool.submit(op(2, 0, 100, 1000)).unwrap();
        let tx = B256::repeat_byte(5);

        assert_eq!(
            pool.mark_submitted_batch(&[a, b, B256::repeat_byte(9)], tx)
                .unwrap(),
            Transition::Applied(2)
        );
        assert_eq!(pool.stats().unwrap().submitted, 2);

        assert_eq!(pool.revert_submitted(tx).unwrap(), Transition::Applied(2));
        for hash in [a, b] {
            let entry = pool.get(hash).unwrap().unwrap();
            assert_eq!(entry.status, EntryStatus::Pending);
            assert_eq!(entry.retry_count, 1);
            assert_eq!(entry.transaction_hash, None);
        }
        assert_eq!(
            pool.report_outcome(tx, OperationOutcome::Included).unwrap(),
            Transition::NotFound
        );
        assert_eq!(pool.revert_submitted(tx).unwrap(), Transition::NotFound);
    }

    #[test]
    fn expiry_boundary() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let now = Timestamp::now();
        let hash = pool.submit_at(op(1, 0, 100, 1000), now).unwrap();
        let expires_at = pool.get(hash).unwrap().unwrap().expires_at;
        assert_eq!(expires_at, now + pool.config().entry_ttl);

        assert_eq!(
            pool.sweep_expired(expires_at - Duration::from_secs(1)).unwrap(),
            0
        );
        assert_eq!(status(&pool, hash), Some(EntryStatus::Pending));

        assert_eq!(pool.sweep_expired(expires_at).unwrap(), 1);
        assert_eq!(status(&pool, hash), None);
        assert!(pool.get_by_sender(Address::repeat_byte(1)).unwrap().is_empty());
        assert_eq!(pool.stats().unwrap().pending, 0);
    }

    #[test]
    fn list_skips_expired_entries() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        pool.submit_at(op(1, 0, 100, 1000), Timestamp::new(1_000))
            .unwrap();
        let live = pool.submit(op(2, 0, 100, 1000)).unwrap();

        let listed = pool.list_pending(10, &ByFirstSeen).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hash, live);
        // listing never mutates
        assert_eq!(pool.stats().unwrap().pending, 2);
    }

    #[test]
    fn terminal_entries_pruned_after_retention() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let hash = pool.submit(op(1, 0, 100, 1000)).unwrap();
        let tx = B256::repeat_byte(6);
        pool.mark_submitted(hash, tx).unwrap();
        pool.report_outcome(tx, OperationOutcome::Included).unwrap();

        assert_eq!(pool.sweep_expired(Timestamp::now()).unwrap(), 0);
        let later = Timestamp::now() + pool.config().terminal_retention + Duration::from_secs(1);
        assert_eq!(pool.sweep_expired(later).unwrap(), 1);
        assert_eq!(status(&pool, hash), None);
        // the nonce is free again once the record is gone
        pool.submit(op(1, 0, 100, 1001)).unwrap();
    }

    #[test]
    fn list_pending_ordering_and_gas() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let low = pool.submit(op(1, 0, 10, 1000)).unwrap();
        let high = pool.submit(op(2, 0, 300, 1000)).unwrap();
        let mid = pool.submit(op(3, 0, 200, 1000)).unwrap();

        let hashes = |entries: Vec<PoolEntry>| entries.into_iter().map(|e| e.hash).collect::<Vec<_>>();
        assert_eq!(
            hashes(pool.list_pending(10, &ByFeePriority).unwrap()),
            vec![high, mid, low]
        );
        assert_eq!(
            hashes(pool.list_pending(2, &ByFeePriority).unwrap()),
            vec![high, mid]
        );

        // each op has a gas limit of 171_000
        assert_eq!(
            hashes(
                pool.list_pending_with_gas(10, U256::from(350_000), &ByFeePriority)
                    .unwrap()
            ),
            vec![high, mid]
        );
        assert!(pool
            .list_pending_with_gas(10, U256::from(100_000), &ByFeePriority)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sender_capacity() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        pool.submit(op(1, 0, 100, 1000)).unwrap();
        assert!(matches!(
            pool.submit(op(1, 1, 100, 1000)),
            Err(MempoolError::MaxOperationsReached(1, e)) if e == Entity::account(Address::repeat_byte(1))
        ));
    }

    #[test]
    fn pool_capacity() {
        let dir = TempDir::new().unwrap();
        let pool = open(
            &dir,
            PoolConfig {
                max_pool_size: 2,
                ..config()
            },
        );
        let first = pool.submit(op(1, 0, 100, 1000)).unwrap();
        pool.submit(op(2, 0, 100, 1000)).unwrap();
        assert!(matches!(
            pool.submit(op(3, 0, 100, 1000)),
            Err(MempoolError::PoolFull(2))
        ));
        // a replacement does not need a new slot
        pool.submit(op(2, 0, 200, 2000)).unwrap();

        assert!(pool.remove(first).unwrap());
        assert!(!pool.remove(first).unwrap());
        pool.submit(op(3, 0, 100, 1000)).unwrap();
    }

    #[test]
    fn capacity_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
        let config = PoolConfig {
            max_pool_size: 1,
            ..config()
        };
        let pool = OpPool::new(store.clone(), config.clone()).unwrap();
        pool.submit(op(1, 0, 100, 1000)).unwrap();
        drop(pool);

        let pool = OpPool::new(store, config).unwrap();
        assert!(matches!(
            pool.submit(op(2, 0, 100, 1000)),
            Err(MempoolError::PoolFull(1))
        ));
    }

    #[test]
    fn banned_entities_rejected() {
        let dir = TempDir::new().unwrap();
        let blocked = Address::repeat_byte(0xbb);
        let pool = open(
            &dir,
            PoolConfig {
                blocklist: HashSet::from([blocked]),
                ..config()
            },
        );
        let paymaster = Address::repeat_byte(0xcc);
        pool.reputation()
            .ban(paymaster, Timestamp::now() + Duration::from_secs(3600))
            .unwrap();

        assert!(matches!(
            pool.submit(with_paymaster(op(1, 0, 100, 1000), paymaster)),
            Err(MempoolError::EntityBanned(e)) if e == Entity::paymaster(paymaster)
        ));
        assert!(matches!(
            pool.submit(op(0xbb, 0, 100, 1000)),
            Err(MempoolError::EntityBanned(e)) if e == Entity::account(blocked)
        ));
        // rejected ops are not counted as seen
        assert_eq!(
            pool.reputation().reputation_of(Address::repeat_byte(1)).unwrap().ops_seen,
            0
        );
    }

    #[test]
    fn throttled_entity_quota() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let paymaster = Address::repeat_byte(0xcc);
        pool.reputation().set_reputation(paymaster, 100, 89).unwrap();

        for sender in 1..=4 {
            pool.submit(with_paymaster(op(sender, 0, 100, 1000), paymaster))
                .unwrap();
        }
        let err = pool
            .submit(with_paymaster(op(5, 0, 100, 1000), paymaster))
            .unwrap_err();
        assert!(matches!(err, MempoolError::EntityThrottled(e) if e == Entity::paymaster(paymaster)));
        assert!(err.is_retryable());
        assert_eq!(pool.stats().unwrap().unique_paymasters, 1);
    }

    #[test]
    fn detected_aggregator_is_tracked() {
        let dir = TempDir::new().unwrap();
        let aggregator = Address::repeat_byte(0xa9);
        let mut detector = MockSchemeDetector::new();
        detector
            .expect_detect_scheme()
            .returning(move |sig| (sig.len() >= 65).then_some(aggregator));
        let pool = open(&dir, config()).with_scheme_detector(Arc::new(detector));

        let hash = pool.submit(op(1, 0, 100, 1000)).unwrap();
        assert_eq!(pool.get(hash).unwrap().unwrap().aggregator, Some(aggregator));
        assert_eq!(
            pool.reputation().reputation_of(aggregator).unwrap().ops_seen,
            1
        );

        let tx = B256::repeat_byte(7);
        pool.mark_submitted(hash, tx).unwrap();
        pool.report_outcome(tx, OperationOutcome::Included).unwrap();
        assert_eq!(
            pool.reputation().reputation_of(aggregator).unwrap().ops_included,
            1
        );
    }

    #[test]
    fn concurrent_same_slot_submits_keep_one_pending() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(open(&dir, config()));

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let _ = pool.submit(op(1, 0, 100 + i * 50, 10_000 + i * 1_000));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = pool.get_by_sender(Address::repeat_byte(1)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Pending);
        assert_eq!(pool.stats().unwrap().pending, 1);
        assert_eq!(pool.list_pending(10, &ByFirstSeen).unwrap().len(), 1);
    }

    #[test]
    fn sweep_quarantines_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let key = B256::repeat_byte(0xde);
        pool.store
            .put(Partition::Pending, key.as_slice(), b"{broken")
            .unwrap();

        assert!(pool.list_pending(10, &ByFirstSeen).unwrap().is_empty());
        assert_eq!(pool.sweep_expired(Timestamp::now()).unwrap(), 0);
        assert!(!pool.store.exists(Partition::Pending, key.as_slice()).unwrap());
        assert_eq!(
            pool.store
                .get(
                    Partition::Metadata,
                    &Partition::Pending.quarantine_key(key.as_slice())
                )
                .unwrap(),
            Some(b"{broken".to_vec())
        );
        assert!(!pool.quarantine(Partition::Pending, key.as_slice()).unwrap());
    }

    #[test]
    fn clear_keeps_reputation() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let hash = pool.submit(op(1, 0, 100, 1000)).unwrap();
        pool.mark_submitted(hash, B256::repeat_byte(8)).unwrap();
        pool.submit(op(2, 0, 100, 1000)).unwrap();

        pool.clear().unwrap();
        assert_eq!(pool.stats().unwrap(), PoolStats::default());
        assert_eq!(
            pool.reputation()
                .reputation_of(Address::repeat_byte(2))
                .unwrap()
                .ops_seen,
            1
        );
        pool.submit(op(2, 0, 100, 1000)).unwrap();
    }

    #[test]
    fn storage_failure_releases_reservation() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        pool.store.close().unwrap();
        assert!(matches!(
            pool.submit(op(1, 0, 100, 1000)),
            Err(MempoolError::Storage(StorageError::Closed))
        ));
        assert_eq!(pool.pending_count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn underpriced_then_replaced_then_included() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let sender = Address::repeat_byte(1);

        let a = pool.submit(op(1, 0, 100, 1000)).unwrap();
        assert!(matches!(
            pool.submit(op(1, 0, 50, 500)),
            Err(MempoolError::ReplacementUnderpriced(p, f)) if p == U256::from(100) && f == U256::from(1000)
        ));
        assert_eq!(status(&pool, a), Some(EntryStatus::Pending));

        let c = pool.submit(op(1, 0, 110, 1100)).unwrap();
        assert_eq!(status(&pool, a), None);
        let tx = B256::with_last_byte(0x01);
        assert_eq!(pool.mark_submitted(c, tx).unwrap(), Transition::Applied(1));

        let before = pool.reputation().reputation_of(sender).unwrap();
        assert_eq!(
            pool.report_outcome_in_block(tx, OperationOutcome::Included, 7)
                .unwrap(),
            Transition::Applied(1)
        );
        let after = pool.reputation().reputation_of(sender).unwrap();
        assert_eq!(after.ops_included, before.ops_included + 1);
        assert_eq!(after.ops_seen, 2);

        let entry = pool.get(c).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Included);
        assert_eq!(entry.block_number, Some(7));
        assert_eq!(entry.transaction_hash, Some(tx));
    }

    #[test]
    fn expired_occupant_does_not_block_its_sender() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let stale_at = Timestamp::now() - pool.config().entry_ttl - Duration::from_secs(10);

        let expired = pool.submit_at(op(1, 0, 100, 1000), stale_at).unwrap();
        assert!(pool.list_pending(10, &ByFirstSeen).unwrap().is_empty());
        // same fees would be underpriced against a live entry
        let fresh = pool.submit(op(1, 0, 100, 1001)).unwrap();
        assert_eq!(status(&pool, expired), None);
        assert_eq!(status(&pool, fresh), Some(EntryStatus::Pending));

        // an expired entry does not count against the sender's capacity
        pool.submit_at(op(2, 0, 100, 1000), stale_at).unwrap();
        pool.submit(op(2, 1, 100, 1000)).unwrap();

        // nor does it make a resubmission of the same operation a duplicate
        let uo = op(3, 0, 100, 1000);
        let hash = pool.submit_at(uo.clone(), stale_at).unwrap();
        assert_eq!(pool.submit(uo).unwrap(), hash);
        let entry = pool.get(hash).unwrap().unwrap();
        assert!(!entry.is_expired(Timestamp::now()));

        assert_eq!(pool.pending_count.load(Ordering::Acquire), 4);
        assert_eq!(pool.stats().unwrap().pending, 4);
    }

    #[test]
    fn expired_entries_do_not_count_toward_throttle() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let paymaster = Address::repeat_byte(0xcc);
        pool.reputation().set_reputation(paymaster, 100, 89).unwrap();
        let stale_at = Timestamp::now() - pool.config().entry_ttl - Duration::from_secs(10);

        for sender in 1..=4 {
            pool.submit_at(with_paymaster(op(sender, 0, 100, 1000), paymaster), stale_at)
                .unwrap();
        }
        pool.submit(with_paymaster(op(5, 0, 100, 1000), paymaster))
            .unwrap();
    }

    #[test]
    fn full_pool_sweeps_expired_before_rejecting() {
        let dir = TempDir::new().unwrap();
        let pool = open(
            &dir,
            PoolConfig {
                max_pool_size: 1,
                ..config()
            },
        );
        let stale_at = Timestamp::now() - pool.config().entry_ttl - Duration::from_secs(10);
        let expired = pool.submit_at(op(1, 0, 100, 1000), stale_at).unwrap();

        let live = pool.submit(op(2, 0, 100, 1000)).unwrap();
        assert_eq!(status(&pool, expired), None);
        assert_eq!(status(&pool, live), Some(EntryStatus::Pending));
        assert!(matches!(
            pool.submit(op(3, 0, 100, 1000)),
            Err(MempoolError::PoolFull(1))
        ));
    }

    #[test]
    fn sweep_keeps_outstanding_reservations() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        pool.submit(op(1, 0, 100, 1000)).unwrap();
        let stale_at = Timestamp::now() - pool.config().entry_ttl - Duration::from_secs(10);
        pool.submit_at(op(2, 0, 100, 1000), stale_at).unwrap();

        // an admission that reserved its slot and has not written yet
        pool.pending_count.fetch_add(1, Ordering::AcqRel);
        assert_eq!(pool.sweep_expired(Timestamp::now()).unwrap(), 1);
        assert_eq!(pool.pending_count.load(Ordering::Acquire), 2);
    }

    #[test]
    fn mark_failed_records_reason() {
        let dir = TempDir::new().unwrap();
        let pool = open(&dir, config());
        let a = pool.submit(op(1, 0, 100, 1000)).unwrap();
        let b = pool.submit(op(2, 0, 100, 1000)).unwrap();
        let tx = B256::repeat_byte(0x0f);
        pool.mark_submitted(b, tx).unwrap();

        // each op may cost up to 171_000 gas at 1000 wei
        assert_eq!(
            pool.stats().unwrap().total_prefund,
            U256::from(2 * 171_000 * 1000)
        );

        assert_eq!(
            pool.mark_failed(&[a, b, a, B256::repeat_byte(9)], "simulation reverted")
                .unwrap(),
            Transition::Applied(2)
        );
        for hash in [a, b] {
            let entry = pool.get(hash).unwrap().unwrap();
            assert_eq!(entry.status, EntryStatus::Failed);
            assert_eq!(entry.error.as_deref(), Some("simulation reverted"));
        }
        let stats = pool.stats().unwrap();
        assert_eq!((stats.pending, stats.submitted, stats.failed), (0, 0, 2));
        assert_eq!(stats.total_prefund, U256::ZERO);
        assert_eq!(pool.pending_count.load(Ordering::Acquire), 0);
        assert_eq!(
            pool.reputation()
                .reputation_of(Address::repeat_byte(2))
                .unwrap()
                .ops_reverted,
            0
        );

        assert_eq!(
            pool.mark_failed(&[a], "again").unwrap(),
            Transition::NotFound
        );
        // the transaction no longer carries anything to settle
        assert_eq!(
            pool.report_outcome(tx, OperationOutcome::Included).unwrap(),
            Transition::Applied(0)
        );
        pool.submit(op(1, 0, 100, 1001)).unwrap();
    }

    #[test]
    fn throttled_quota_holds_across_senders() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(open(&dir, config()));
        let paymaster = Address::repeat_byte(0xcc);
        pool.reputation().set_reputation(paymaster, 100, 89).unwrap();

        let handles: Vec<_> = (1..=16u8)
            .map(|sender| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let _ = pool.submit(with_paymaster(op(sender, 0, 100, 1000), paymaster));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            pool.stats().unwrap().pending,
            pool.config().throttled_entity_mempool_count
        );
    }
}
