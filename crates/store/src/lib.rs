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

//! Persistence substrate for Quay: isolated partitions over RocksDB column
//! families, atomic multi-partition batches and point-in-time snapshots.

mod batch;
pub use batch::{BatchOp, WriteBatch};

mod blocking;
pub use blocking::run_blocking;

pub mod codec;

mod config;
pub use config::StoreConfig;

mod error;
pub use error::{StorageError, StorageResult};

mod partition;
pub use partition::Partition;

mod store;
pub use store::{PartitionIter, Snapshot, Store, SCHEMA_VERSION, SCHEMA_VERSION_KEY};
