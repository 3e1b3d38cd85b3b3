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

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

/// RocksDB settings for the store
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StoreConfig {
    /// Database directory
    pub path: PathBuf,
    /// fsync the WAL on every write
    pub sync_writes: bool,
    /// Give up opening the database after this long
    #[serde_as(as = "DurationSeconds<u64>")]
    pub open_timeout: Duration,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Write buffer size in bytes
    pub write_buffer_size: usize,
    /// Maximum number of write buffers
    pub max_write_buffer_number: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/quay"),
            sync_writes: true,
            open_timeout: Duration::from_secs(30),
            block_cache_size: 64 * 1024 * 1024,
            write_buffer_size: 16 * 1024 * 1024,
            max_write_buffer_number: 3,
        }
    }
}

impl StoreConfig {
    /// Small buffers and no fsync, for tests
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            open_timeout: Duration::from_secs(10),
            block_cache_size: 4 * 1024 * 1024,
            write_buffer_size: 1024 * 1024,
            max_write_buffer_number: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_partial() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"path": "/tmp/q", "open_timeout": 5}"#).unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/q"));
        assert_eq!(config.open_timeout, Duration::from_secs(5));
        assert!(config.sync_writes);
    }
}
