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

//! JSON value encoding shared by every record type

use serde::{de::DeserializeOwned, Serialize};

use crate::{Partition, StorageError, StorageResult};

/// Encodes a record value
pub fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| StorageError::Unavailable(format!("failed to encode record: {e}")))
}

/// Decodes a record read from `partition` at `key`.
///
/// A value that does not decode is reported as [`StorageError::Corrupt`].
pub fn decode<T: DeserializeOwned>(partition: Partition, key: &[u8], raw: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(raw).map_err(|e| StorageError::corrupt_record(partition, key, e))
}
