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

use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use parse_display::Display;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use strum::EnumIter;

use crate::{Entity, Timestamp, UserOperation, UserOperationId};

/// Lifecycle state of a pool entry
#[derive(Display, Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, Serialize, Deserialize)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Admitted, waiting to be bundled
    Pending,
    /// Sent on chain inside a bundle transaction
    Submitted,
    /// Bundle transaction landed and the operation executed
    Included,
    /// Bundle transaction landed and the operation reverted
    Failed,
}

/// A user operation held by the pool, together with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    /// The operation as submitted
    pub uo: UserOperation,
    /// Content hash, also the storage key
    pub hash: B256,
    /// Current lifecycle state
    pub status: EntryStatus,
    /// Admission time
    pub first_seen: Timestamp,
    /// Time of the last state change
    pub last_updated: Timestamp,
    /// `first_seen + ttl`
    pub expires_at: Timestamp,
    /// Bundle transaction carrying the operation, once submitted
    pub transaction_hash: Option<B256>,
    /// Aggregator attributed from the signature at admission
    pub aggregator: Option<Address>,
    /// Times the operation went back to pending after a dropped bundle
    pub retry_count: u32,
    /// Block the bundle transaction landed in, when reported
    #[serde(default)]
    pub block_number: Option<u64>,
    /// Why the operation failed, when failed locally
    #[serde(default)]
    pub error: Option<String>,
}

impl PoolEntry {
    /// A fresh pending entry
    pub fn new_pending(
        uo: UserOperation,
        hash: B256,
        aggregator: Option<Address>,
        now: Timestamp,
        ttl: Duration,
    ) -> Self {
        Self {
            uo,
            hash,
            status: EntryStatus::Pending,
            first_seen: now,
            last_updated: now,
            expires_at: now + ttl,
            transaction_hash: None,
            aggregator,
            retry_count: 0,
            block_number: None,
            error: None,
        }
    }

    /// The slot this entry occupies
    pub fn id(&self) -> UserOperationId {
        self.uo.id()
    }

    /// True once `expires_at` is reached
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }

    /// Every entity whose reputation this entry counts against
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities = self.uo.entities();
        if let Some(aggregator) = self.aggregator {
            entities.push(Entity::aggregator(aggregator));
        }
        entities
    }
}

/// What the chain said about a submitted bundle transaction
#[derive(Display, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[display(style = "snake_case")]
pub enum OperationOutcome {
    /// The operations executed
    Included,
    /// The operations reverted
    Failed,
}

impl OperationOutcome {
    /// The terminal status entries move to
    pub fn status(self) -> EntryStatus {
        match self {
            OperationOutcome::Included => EntryStatus::Included,
            OperationOutcome::Failed => EntryStatus::Failed,
        }
    }
}

/// Result of a lifecycle transition request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// This many entries changed state
    Applied(usize),
    /// Nothing matched the request
    NotFound,
}

/// Counts of pool contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Entries waiting to be bundled
    pub pending: usize,
    /// Entries in flight
    pub submitted: usize,
    /// Entries retained after inclusion
    pub included: usize,
    /// Entries retained after failure
    pub failed: usize,
    /// Distinct senders among pending and submitted entries
    pub unique_senders: usize,
    /// Distinct paymasters among pending and submitted entries
    pub unique_paymasters: usize,
    /// Sum of the worst-case gas cost of pending and submitted entries, in wei
    pub total_prefund: U256,
}

/// Persisted reputation counters of one address.
///
/// Status is never stored, see [`Reputation`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationEntry {
    /// The entity's address
    pub address: Address,
    /// Operations admitted that named this address
    pub ops_seen: u64,
    /// Operations included on chain that named this address
    pub ops_included: u64,
    /// Operations reverted on chain that named this address
    pub ops_reverted: u64,
    /// Manual ban expiry
    pub banned_until: Option<Timestamp>,
}

impl ReputationEntry {
    /// Zeroed counters for an address never seen before
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// `ops_seen - ops_included`, floored at zero
    pub fn outstanding(&self) -> u64 {
        self.ops_seen.saturating_sub(self.ops_included)
    }
}

/// The reputation of an entity, with its status derived at read time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reputation {
    /// Stored counters
    #[serde(flatten)]
    pub entry: ReputationEntry,
    /// Status at the time of the read
    pub status: ReputationStatus,
}

/// Reputation status for an entity
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReputationStatus {
    /// Entity is not throttled or banned
    Ok,
    /// Entity is throttled
    Throttled,
    /// Entity is banned
    Banned,
}

impl Serialize for ReputationStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ReputationStatus::Ok => serializer.serialize_str("ok"),
            ReputationStatus::Throttled => serializer.serialize_str("throttled"),
            ReputationStatus::Banned => serializer.serialize_str("banned"),
        }
    }
}

impl<'de> Deserialize<'de> for ReputationStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "ok" => Ok(ReputationStatus::Ok),
            "throttled" => Ok(ReputationStatus::Throttled),
            "banned" => Ok(ReputationStatus::Banned),
            _ => Err(de::Error::custom(format!("Invalid reputation status {s}"))),
        }
    }
}
