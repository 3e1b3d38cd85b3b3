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

use std::fmt::Debug;

use quay_types::aggregator::AggregatorCosts;

/// Prices an aggregated bundle
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait CostModel: Send + Sync + Debug {
    /// Gas of the aggregator's on-chain verification for `n` operations
    fn execution_gas(&self, n: usize) -> u128;

    /// Length in bytes of the aggregated signature for `n` operations
    fn signature_length(&self, n: usize) -> u128;
}

/// `fixed + n * variable` for both gas and signature length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearCostModel {
    costs: AggregatorCosts,
}

impl LinearCostModel {
    /// Model over an aggregator's published costs
    pub fn new(costs: AggregatorCosts) -> Self {
        Self { costs }
    }
}

impl CostModel for LinearCostModel {
    fn execution_gas(&self, n: usize) -> u128 {
        self.costs
            .execution_fixed_gas
            .saturating_add((n as u128).saturating_mul(self.costs.execution_variable_gas))
    }

    fn signature_length(&self, n: usize) -> u128 {
        self.costs
            .sig_fixed_length
            .saturating_add((n as u128).saturating_mul(self.costs.sig_variable_length))
    }
}
