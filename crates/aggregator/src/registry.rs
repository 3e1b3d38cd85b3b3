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

use std::{fmt, sync::Arc};

use alloy_primitives::{address, Address};
use quay_types::aggregator::{
    AggregatorCosts, CurveOps, MessageHasher, SchemeDetector, SchemeId, SignatureAggregatorError,
    SignatureAggregatorResult, SignatureLayout,
};
use tracing::info;

use crate::{bls::BlstCurve, engine::SchemeAggregator};

/// Default address of the BLS aggregator contract
pub const BLS_AGGREGATOR_ADDRESS: Address = address!("9d3a231e887a495ce6c454e7a38ed5e734bd5de4");

const BLS_AGGREGATOR_COSTS: AggregatorCosts = AggregatorCosts {
    execution_fixed_gas: 125_000,
    execution_variable_gas: 120_000,
    sig_fixed_length: 96,
    sig_variable_length: 48,
};

/// Errors building a registry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two registrations share an address
    #[error("Aggregator {0} registered twice")]
    DuplicateAddress(Address),
    /// A registration's layout cannot hold a signature and a key
    #[error("Aggregator {0} has an empty signature layout")]
    EmptyLayout(Address),
}

/// An on-chain aggregator and the scheme it verifies
#[derive(Clone)]
pub struct AggregatorRegistration {
    /// Aggregator contract address
    pub address: Address,
    /// Scheme the contract verifies
    pub scheme: SchemeId,
    /// Per-operation signature layout
    pub layout: SignatureLayout,
    /// Curve operations for the scheme
    pub curve: Arc<dyn CurveOps>,
    /// Entry points the aggregator serves
    pub entry_points: Vec<Address>,
    /// Published on-chain costs
    pub costs: AggregatorCosts,
}

impl fmt::Debug for AggregatorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorRegistration")
            .field("address", &self.address)
            .field("scheme", &self.scheme)
            .field("entry_points", &self.entry_points)
            .finish_non_exhaustive()
    }
}

impl AggregatorRegistration {
    /// A registration for `scheme` with its standard layout
    pub fn new(
        address: Address,
        scheme: SchemeId,
        curve: Arc<dyn CurveOps>,
        entry_points: Vec<Address>,
        costs: AggregatorCosts,
    ) -> Self {
        Self {
            address,
            scheme,
            layout: scheme.layout(),
            curve,
            entry_points,
            costs,
        }
    }

    /// The `blst` backed BLS aggregator, at its default address unless overridden
    pub fn bls(address_override: Option<Address>, entry_points: Vec<Address>) -> Self {
        Self::new(
            address_override.unwrap_or(BLS_AGGREGATOR_ADDRESS),
            SchemeId::Bls12381MinPk,
            Arc::new(BlstCurve),
            entry_points,
            BLS_AGGREGATOR_COSTS,
        )
    }

    /// Whether the aggregator serves `entry_point`
    pub fn serves(&self, entry_point: Address) -> bool {
        self.entry_points.contains(&entry_point)
    }
}

/// The fixed set of aggregators known at start-up
#[derive(Debug, Default, Clone)]
pub struct AggregatorRegistry {
    registrations: Vec<Arc<AggregatorRegistration>>,
}

impl AggregatorRegistry {
    /// Build a registry. Order matters for scheme detection ties.
    pub fn new(
        registrations: impl IntoIterator<Item = AggregatorRegistration>,
    ) -> Result<Self, RegistryError> {
        let mut out: Vec<Arc<AggregatorRegistration>> = vec![];
        for registration in registrations {
            if out.iter().any(|r| r.address == registration.address) {
                return Err(RegistryError::DuplicateAddress(registration.address));
            }
            if registration.layout.signature_size == 0 || registration.layout.public_key_size == 0
            {
                return Err(RegistryError::EmptyLayout(registration.address));
            }
            info!(
                "Registered {} aggregator at {}",
                registration.scheme, registration.address
            );
            out.push(Arc::new(registration));
        }
        Ok(Self { registrations: out })
    }

    /// Registration at `address`
    pub fn get(&self, address: Address) -> SignatureAggregatorResult<&Arc<AggregatorRegistration>> {
        self.registrations
            .iter()
            .find(|r| r.address == address)
            .ok_or(SignatureAggregatorError::UnsupportedAggregator(address))
    }

    /// All registrations in registration order
    pub fn registrations(&self) -> &[Arc<AggregatorRegistration>] {
        &self.registrations
    }

    /// An engine for the aggregator at `address`
    pub fn aggregator(
        &self,
        address: Address,
        chain_id: u64,
        hasher: Arc<dyn MessageHasher>,
    ) -> SignatureAggregatorResult<SchemeAggregator> {
        Ok(SchemeAggregator::new(
            self.get(address)?.clone(),
            chain_id,
            hasher,
        ))
    }
}

impl SchemeDetector for AggregatorRegistry {
    fn detect_scheme(&self, signature: &[u8]) -> Option<Address> {
        let mut best: Option<&AggregatorRegistration> = None;
        for registration in &self.registrations {
            let min_len = registration.layout.min_len();
            if signature.len() < min_len {
                continue;
            }
            if best.map_or(true, |b| min_len > b.layout.min_len()) {
                best = Some(registration);
            }
        }
        best.map(|r| r.address)
    }
}
