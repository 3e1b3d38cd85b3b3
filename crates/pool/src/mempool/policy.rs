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

//! Admission policies the pool delegates to

use std::{cmp::Ordering, fmt::Debug};

use alloy_primitives::U256;
use quay_types::{pool::PoolEntry, UserOperation};
use quay_utils::math;

/// Decides whether an operation may evict the pending operation in its slot.
///
/// Implementations must be deterministic: the same pair always gets the same answer.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait ReplacementPolicy: Send + Sync + Debug {
    /// True if `replacement` may take the place of `existing`
    fn may_replace(&self, existing: &UserOperation, replacement: &UserOperation) -> bool;
}

/// Requires both fee fields to rise by a minimum percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBumpPolicy {
    min_increase_percentage: u32,
}

impl FeeBumpPolicy {
    /// Policy demanding at least `min_increase_percentage` percent on both fees
    pub fn new(min_increase_percentage: u32) -> Self {
        Self {
            min_increase_percentage,
        }
    }

    /// Lowest `(max_priority_fee_per_gas, max_fee_per_gas)` that can replace `existing`
    pub fn min_replacement_fees(&self, existing: &UserOperation) -> (U256, U256) {
        (
            math::uint_increase_by_percent(
                existing.max_priority_fee_per_gas,
                self.min_increase_percentage,
            ),
            math::uint_increase_by_percent(existing.max_fee_per_gas, self.min_increase_percentage),
        )
    }
}

impl Default for FeeBumpPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ReplacementPolicy for FeeBumpPolicy {
    fn may_replace(&self, existing: &UserOperation, replacement: &UserOperation) -> bool {
        let (priority_fee, fee) = self.min_replacement_fees(existing);
        replacement.max_priority_fee_per_gas >= priority_fee && replacement.max_fee_per_gas >= fee
    }
}

/// Total order used to rank pending entries for bundling.
///
/// `Less` means "bundle first".
pub trait EntryOrdering: Send + Sync + Debug {
    /// Compare two entries
    fn compare(&self, a: &PoolEntry, b: &PoolEntry) -> Ordering;
}

/// Highest priority fee first, then oldest, then by hash
#[derive(Debug, Clone, Copy, Default)]
pub struct ByFeePriority;

impl EntryOrdering for ByFeePriority {
    fn compare(&self, a: &PoolEntry, b: &PoolEntry) -> Ordering {
        b.uo
            .max_priority_fee_per_gas
            .cmp(&a.uo.max_priority_fee_per_gas)
            .then_with(|| a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.hash.cmp(&b.hash))
    }
}

/// Oldest first, then by hash
#[derive(Debug, Clone, Copy, Default)]
pub struct ByFirstSeen;

impl EntryOrdering for ByFirstSeen {
    fn compare(&self, a: &PoolEntry, b: &PoolEntry) -> Ordering {
        a.first_seen
            .cmp(&b.first_seen)
            .then_with(|| a.hash.cmp(&b.hash))
    }
}
