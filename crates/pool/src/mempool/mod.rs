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

//! Persisted operation pool

use std::{collections::HashSet, time::Duration};

use alloy_primitives::{address, Address};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

mod locks;

mod policy;
pub use policy::{ByFeePriority, ByFirstSeen, EntryOrdering, FeeBumpPolicy, ReplacementPolicy};

mod pool;
pub use pool::OpPool;

mod reputation;
pub use reputation::{
    CounterChange, ReputationEngine, ReputationParams, StagedReputation, LAST_DECAY_KEY,
};

/// Canonical v0.6 entry point
pub const ENTRY_POINT_V0_6: Address = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");

/// Configuration of an [`OpPool`]
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PoolConfig {
    /// Entry point the pool admits operations for
    pub entry_point: Address,
    /// Chain id, part of every operation hash
    pub chain_id: u64,
    /// Maximum number of pending operations
    pub max_pool_size: usize,
    /// Maximum pending operations per sender
    pub same_sender_mempool_count: usize,
    /// Maximum pending operations naming a throttled entity
    pub throttled_entity_mempool_count: usize,
    /// Minimum fee increase for a replacement, in percent
    pub min_replacement_fee_increase_percentage: u32,
    /// Lifetime of a pending operation
    #[serde_as(as = "DurationSeconds<u64>")]
    pub entry_ttl: Duration,
    /// How long included and failed entries are kept
    #[serde_as(as = "DurationSeconds<u64>")]
    pub terminal_retention: Duration,
    /// Addresses that are always banned
    pub blocklist: HashSet<Address>,
    /// Addresses that are never throttled or banned
    pub allowlist: HashSet<Address>,
    /// Reputation thresholds
    pub reputation: ReputationParams,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            entry_point: ENTRY_POINT_V0_6,
            chain_id: 1,
            max_pool_size: 1000,
            same_sender_mempool_count: 1,
            throttled_entity_mempool_count: 4,
            min_replacement_fee_increase_percentage: 10,
            entry_ttl: Duration::from_secs(30 * 60),
            terminal_retention: Duration::from_secs(24 * 60 * 60),
            blocklist: HashSet::new(),
            allowlist: HashSet::new(),
            reputation: ReputationParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: PoolConfig = serde_json::from_str(
            r#"{
                "chain_id": 1337,
                "entry_ttl": 60,
                "reputation": {"ban_slack": 20},
                "blocklist": ["0x0000000000000000000000000000000000000001"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.chain_id, 1337);
        assert_eq!(config.entry_ttl, Duration::from_secs(60));
        assert_eq!(config.entry_point, ENTRY_POINT_V0_6);
        assert_eq!(config.reputation.ban_slack, 20);
        assert_eq!(config.reputation.throttling_slack, 10);
        assert!(config.blocklist.contains(&Address::with_last_byte(1)));
        assert_eq!(config.same_sender_mempool_count, 1);
    }
}
