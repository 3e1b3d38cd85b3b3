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

use parse_display::Display;
use strum::{EnumIter, IntoEnumIterator};

/// An isolated key space of the store, backed by one column family.
///
/// The set is fixed. Names are part of the on-disk format.
#[derive(Display, Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter)]
#[display(style = "snake_case")]
pub enum Partition {
    /// Pending pool entries keyed by operation hash
    Pending,
    /// Submitted pool entries keyed by operation hash
    Submitted,
    /// Included pool entries keyed by operation hash
    Included,
    /// Failed pool entries keyed by operation hash
    Failed,
    /// Sender and nonce to operation hash
    SenderIndex,
    /// Bundle transaction hash to the operation hashes it carries
    TxMapping,
    /// Reputation counters keyed by address
    Reputation,
    /// Store and maintenance metadata
    Metadata,
}

impl Partition {
    /// Column family name
    pub fn name(self) -> &'static str {
        match self {
            Partition::Pending => "pending",
            Partition::Submitted => "submitted",
            Partition::Included => "included",
            Partition::Failed => "failed",
            Partition::SenderIndex => "sender_index",
            Partition::TxMapping => "tx_mapping",
            Partition::Reputation => "reputation",
            Partition::Metadata => "metadata",
        }
    }

    /// Every partition, in creation order
    pub fn all() -> impl Iterator<Item = Partition> {
        Partition::iter()
    }

    /// Metadata key holding the raw bytes of a corrupt record moved out of
    /// this partition
    pub fn quarantine_key(self, key: &[u8]) -> Vec<u8> {
        format!("quarantine/{}/{}", self.name(), const_hex::encode(key)).into_bytes()
    }
}
