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

use alloy_primitives::{Address, B256, U256};
use quay_store::StorageError;
use quay_types::{Entity, ValidationError};

/// Result type for pool calls
pub type MempoolResult<T> = std::result::Result<T, MempoolError>;

/// Mempool error type.
///
/// Every rejection of a submitted operation is one of these; `Storage` is the
/// only variant that is not the submitter's business.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// The operation failed shape validation
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// An entity of the operation is banned
    #[error("Entity {0} is banned")]
    EntityBanned(Entity),
    /// An entity of the operation is throttled and already has its quota of pending operations
    #[error("Entity {0} is throttled")]
    EntityThrottled(Entity),
    /// Operation with same sender/nonce already in pool
    /// and the replacement operation has lower gas price.
    #[error("Replacement operation underpriced. Existing priority fee: {0}. Existing fee: {1}")]
    ReplacementUnderpriced(U256, U256),
    /// An operation with this sender and nonce was already included
    #[error("Nonce {1} of sender {0} was already used")]
    NonceAlreadyUsed(Address, U256),
    /// Operation with the same hash already in pool
    #[error("Operation already known")]
    OperationAlreadyKnown,
    /// The slot's operation is in a submitted bundle
    #[error("Operation {0} for this sender and nonce is in flight")]
    OperationInFlight(B256),
    /// Max pending operations reached for an entity
    #[error("Max operations ({0}) reached for entity {1}")]
    MaxOperationsReached(usize, Entity),
    /// The pool holds its maximum number of pending operations
    #[error("Pool is full ({0} pending operations)")]
    PoolFull(usize),
    /// The store failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MempoolError {
    /// Stable snake case identifier of the rejection reason
    pub fn reason_code(&self) -> &'static str {
        match self {
            MempoolError::Validation(_) => "validation",
            MempoolError::EntityBanned(_) => "entity_banned",
            MempoolError::EntityThrottled(_) => "entity_throttled",
            MempoolError::ReplacementUnderpriced(_, _) => "replacement_underpriced",
            MempoolError::NonceAlreadyUsed(_, _) => "nonce_already_used",
            MempoolError::OperationAlreadyKnown => "operation_already_known",
            MempoolError::OperationInFlight(_) => "operation_in_flight",
            MempoolError::MaxOperationsReached(_, _) => "max_operations_reached",
            MempoolError::PoolFull(_) => "pool_full",
            MempoolError::Storage(_) => "storage",
        }
    }

    /// Whether the same payload may be accepted if submitted again later.
    ///
    /// Capacity and throttling clear over time; everything else needs a
    /// different operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            MempoolError::PoolFull(_)
            | MempoolError::EntityThrottled(_)
            | MempoolError::MaxOperationsReached(_, _)
            | MempoolError::OperationInFlight(_) => true,
            MempoolError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}
