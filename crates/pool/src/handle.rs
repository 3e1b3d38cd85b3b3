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

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, U256};
use quay_store::run_blocking;
use quay_types::{
    pool::{OperationOutcome, PoolEntry, PoolStats, Reputation, Transition},
    Timestamp, UserOperation,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::MempoolResult,
    mempool::{EntryOrdering, OpPool},
};

/// Async handle to an [`OpPool`].
///
/// Every call runs on the blocking thread pool, bounded by the handle's
/// request timeout and the caller's cancellation token. A call abandoned by
/// its caller still completes or fails as a whole.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    pool: Arc<OpPool>,
    request_timeout: Duration,
}

impl PoolHandle {
    /// Wrap `pool`
    pub fn new(pool: Arc<OpPool>, request_timeout: Duration) -> Self {
        Self {
            pool,
            request_timeout,
        }
    }

    /// The wrapped pool
    pub fn pool(&self) -> &Arc<OpPool> {
        &self.pool
    }

    /// See [`OpPool::submit`]
    pub async fn submit(&self, uo: UserOperation, cancel: &CancellationToken) -> MempoolResult<B256> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || pool.submit(uo)).await
    }

    /// See [`OpPool::mark_submitted`]
    pub async fn mark_submitted(
        &self,
        hash: B256,
        tx_hash: B256,
        cancel: &CancellationToken,
    ) -> MempoolResult<Transition> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            pool.mark_submitted(hash, tx_hash)
        })
        .await
    }

    /// See [`OpPool::mark_submitted_batch`]
    pub async fn mark_submitted_batch(
        &self,
        hashes: Vec<B256>,
        tx_hash: B256,
        cancel: &CancellationToken,
    ) -> MempoolResult<Transition> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            pool.mark_submitted_batch(&hashes, tx_hash)
        })
        .await
    }

    /// See [`OpPool::report_outcome`]
    pub async fn report_outcome(
        &self,
        tx_hash: B256,
        outcome: OperationOutcome,
        cancel: &CancellationToken,
    ) -> MempoolResult<Transition> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            pool.report_outcome(tx_hash, outcome)
        })
        .await
    }

    /// See [`OpPool::report_outcome_in_block`]
    pub async fn report_outcome_in_block(
        &self,
        tx_hash: B256,
        outcome: OperationOutcome,
        block_number: u64,
        cancel: &CancellationToken,
    ) -> MempoolResult<Transition> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            pool.report_outcome_in_block(tx_hash, outcome, block_number)
        })
        .await
    }

    /// See [`OpPool::mark_failed`]
    pub async fn mark_failed(
        &self,
        hashes: Vec<B256>,
        reason: String,
        cancel: &CancellationToken,
    ) -> MempoolResult<Transition> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            pool.mark_failed(&hashes, &reason)
        })
        .await
    }

    /// See [`OpPool::revert_submitted`]
    pub async fn revert_submitted(
        &self,
        tx_hash: B256,
        cancel: &CancellationToken,
    ) -> MempoolResult<Transition> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            pool.revert_submitted(tx_hash)
        })
        .await
    }

    /// See [`OpPool::sweep_expired`]
    pub async fn sweep_expired(
        &self,
        now: Timestamp,
        cancel: &CancellationToken,
    ) -> MempoolResult<usize> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || pool.sweep_expired(now)).await
    }

    /// See [`OpPool::list_pending`]
    pub async fn list_pending<O>(
        &self,
        limit: usize,
        order: O,
        cancel: &CancellationToken,
    ) -> MempoolResult<Vec<PoolEntry>>
    where
        O: EntryOrdering + 'static,
    {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            pool.list_pending(limit, &order)
        })
        .await
    }

    /// See [`OpPool::list_pending_with_gas`]
    pub async fn list_pending_with_gas<O>(
        &self,
        limit: usize,
        max_gas: U256,
        order: O,
        cancel: &CancellationToken,
    ) -> MempoolResult<Vec<PoolEntry>>
    where
        O: EntryOrdering + 'static,
    {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            pool.list_pending_with_gas(limit, max_gas, &order)
        })
        .await
    }

    /// See [`OpPool::get`]
    pub async fn get(&self, hash: B256, cancel: &CancellationToken) -> MempoolResult<Option<PoolEntry>> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || pool.get(hash)).await
    }

    /// See [`OpPool::get_by_sender`]
    pub async fn get_by_sender(
        &self,
        sender: Address,
        cancel: &CancellationToken,
    ) -> MempoolResult<Vec<PoolEntry>> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || pool.get_by_sender(sender)).await
    }

    /// See [`OpPool::remove`]
    pub async fn remove(&self, hash: B256, cancel: &CancellationToken) -> MempoolResult<bool> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || pool.remove(hash)).await
    }

    /// See [`OpPool::stats`]
    pub async fn stats(&self, cancel: &CancellationToken) -> MempoolResult<PoolStats> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || pool.stats()).await
    }

    /// See [`OpPool::clear`]
    pub async fn clear(&self, cancel: &CancellationToken) -> MempoolResult<()> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || pool.clear()).await
    }

    /// Reputation of `address` with its current status
    pub async fn reputation(
        &self,
        address: Address,
        cancel: &CancellationToken,
    ) -> MempoolResult<Reputation> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || {
            Ok(pool.reputation().reputation(address, Timestamp::now()))
        })
        .await
    }

    /// Every stored reputation with its current status
    pub async fn dump_reputation(&self, cancel: &CancellationToken) -> MempoolResult<Vec<Reputation>> {
        let pool = self.pool.clone();
        run_blocking(cancel, self.request_timeout, move || -> MempoolResult<_> {
            Ok(pool.reputation().dump(Timestamp::now())?)
        })
        .await
    }
}
