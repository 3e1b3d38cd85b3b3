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
//! Signature aggregation for Quay.
//!
//! A closed registry of aggregators, each bound to one [`SchemeId`], and an
//! engine that combines and verifies per-operation signatures of a scheme.
//!
//! [`SchemeId`]: quay_types::aggregator::SchemeId

mod bls;
pub use bls::{BlstCurve, BLS_DST};

mod costs;
pub use costs::{CostModel, LinearCostModel};

mod engine;
pub use engine::SchemeAggregator;

mod registry;
pub use registry::{
    AggregatorRegistration, AggregatorRegistry, RegistryError, BLS_AGGREGATOR_ADDRESS,
};
