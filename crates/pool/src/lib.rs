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

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
//! Persisted operation pool and reputation engine for Quay.

mod error;
pub use error::{MempoolError, MempoolResult};

mod handle;
pub use handle::PoolHandle;

mod mempool;
pub use mempool::{
    ByFeePriority, ByFirstSeen, CounterChange, EntryOrdering, FeeBumpPolicy, OpPool, PoolConfig,
    ReplacementPolicy, ReputationEngine, ReputationParams, StagedReputation, ENTRY_POINT_V0_6,
    LAST_DECAY_KEY,
};

mod task;
pub use task::{MaintenanceConfig, MaintenanceTask};
