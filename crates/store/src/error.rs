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

use crate::Partition;

/// Storage error type
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The database cannot be reached or the write did not go through
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The store was closed
    #[error("storage closed")]
    Closed,
    /// A record or the database itself is damaged
    #[error("storage corrupt: {0}")]
    Corrupt(String),
    /// The caller's deadline passed before the call finished
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    /// The caller cancelled the call
    #[error("storage call cancelled")]
    Cancelled,
    /// A column family is missing from the database
    #[error("unknown partition {0}")]
    UnknownPartition(String),
}

impl StorageError {
    /// Undecodable record in `partition` at `key`
    pub fn corrupt_record(partition: Partition, key: &[u8], reason: impl std::fmt::Display) -> Self {
        Self::Corrupt(format!(
            "{partition}/{}: {reason}",
            const_hex::encode_prefixed(key)
        ))
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(error: rocksdb::Error) -> Self {
        match error.kind() {
            rocksdb::ErrorKind::Corruption => Self::Corrupt(error.into_string()),
            _ => Self::Unavailable(error.into_string()),
        }
    }
}

/// Result type for store calls
pub type StorageResult<T> = Result<T, StorageError>;
