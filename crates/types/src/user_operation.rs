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

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::SolValue;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{Entity, EntityType};

/// Unique identifier for a user operation from a given sender
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserOperationId {
    /// sender of user operation
    pub sender: Address,
    /// nonce of user operation
    pub nonce: U256,
}

impl UserOperationId {
    /// Length of the storage key produced by `to_key`
    pub const KEY_LEN: usize = 20 + 32;

    /// Sender address followed by the big-endian nonce.
    ///
    /// Keys of one sender share the 20 byte address prefix.
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[..20].copy_from_slice(self.sender.as_slice());
        key[20..].copy_from_slice(&self.nonce.to_be_bytes::<32>());
        key
    }
}

/// Shape errors detected before an operation touches the pool.
///
/// These are always the submitter's fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The sender is the zero address
    #[error("sender is the zero address")]
    ZeroSender,
    /// The signature is empty
    #[error("signature is empty")]
    EmptySignature,
    /// `initCode` is non-empty but too short to name a factory
    #[error("initCode has {0} bytes, must be empty or at least 20")]
    TruncatedInitCode(usize),
    /// `paymasterAndData` is non-empty but too short to name a paymaster
    #[error("paymasterAndData has {0} bytes, must be empty or at least 20")]
    TruncatedPaymasterAndData(usize),
    /// The verification gas limit is zero
    #[error("verificationGasLimit must be non-zero")]
    ZeroVerificationGasLimit,
    /// Priority fee exceeds the max fee
    #[error("maxPriorityFeePerGas {0} exceeds maxFeePerGas {1}")]
    PriorityFeeAboveMaxFee(U256, U256),
}

/// An ERC-4337 user operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    /// Smart account sending the operation
    pub sender: Address,
    /// Anti-replay nonce
    pub nonce: U256,
    /// Factory address followed by factory calldata, empty if the account exists
    pub init_code: Bytes,
    /// Calldata for the account's execution phase
    pub call_data: Bytes,
    /// Gas for the execution phase
    pub call_gas_limit: U256,
    /// Gas for the verification phase
    pub verification_gas_limit: U256,
    /// Gas paid up front for bundler overhead
    pub pre_verification_gas: U256,
    /// EIP-1559 max fee per gas
    pub max_fee_per_gas: U256,
    /// EIP-1559 max priority fee per gas
    pub max_priority_fee_per_gas: U256,
    /// Paymaster address followed by paymaster data, empty if unsponsored
    pub paymaster_and_data: Bytes,
    /// Scheme specific signature
    pub signature: Bytes,
}

impl UserOperation {
    /// Canonical content hash of the operation for an entry point and chain.
    ///
    /// The signature is not part of the hash so this is also the message signers sign.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        keccak256(
            (
                keccak256(self.pack_for_hash()),
                entry_point,
                U256::from(chain_id),
            )
                .abi_encode(),
        )
    }

    /// The pool slot this operation occupies
    pub fn id(&self) -> UserOperationId {
        UserOperationId {
            sender: self.sender,
            nonce: self.nonce,
        }
    }

    /// Factory named by `initCode`, if any
    pub fn factory(&self) -> Option<Address> {
        Self::get_address_from_field(&self.init_code)
    }

    /// Paymaster named by `paymasterAndData`, if any
    pub fn paymaster(&self) -> Option<Address> {
        Self::get_address_from_field(&self.paymaster_and_data)
    }

    /// All entities the operation names directly.
    ///
    /// The aggregator is never named by the operation itself; callers attribute it
    /// from the signature.
    pub fn entities(&self) -> Vec<Entity> {
        EntityType::iter()
            .filter_map(|entity| {
                self.entity_address(entity)
                    .map(|address| Entity::new(entity, address))
            })
            .collect()
    }

    /// Sum of the three gas limits
    pub fn total_gas_limit(&self) -> U256 {
        self.pre_verification_gas
            .saturating_add(self.call_gas_limit)
            .saturating_add(self.verification_gas_limit)
    }

    /// Upper bound of what the operation can be charged.
    ///
    /// A paymaster triples the verification gas to cover its `postOp`.
    pub fn max_gas_cost(&self) -> U256 {
        let mul = if self.paymaster().is_some() { 3 } else { 1 };
        let gas = self
            .pre_verification_gas
            .saturating_add(self.call_gas_limit)
            .saturating_add(self.verification_gas_limit.saturating_mul(U256::from(mul)));
        self.max_fee_per_gas.saturating_mul(gas)
    }

    /// Structural checks that need no chain access
    pub fn validate_shape(&self) -> Result<(), ValidationError> {
        if self.sender.is_zero() {
            return Err(ValidationError::ZeroSender);
        }
        if self.signature.is_empty() {
            return Err(ValidationError::EmptySignature);
        }
        if !self.init_code.is_empty() && self.init_code.len() < 20 {
            return Err(ValidationError::TruncatedInitCode(self.init_code.len()));
        }
        if !self.paymaster_and_data.is_empty() && self.paymaster_and_data.len() < 20 {
            return Err(ValidationError::TruncatedPaymasterAndData(
                self.paymaster_and_data.len(),
            ));
        }
        if self.verification_gas_limit.is_zero() {
            return Err(ValidationError::ZeroVerificationGasLimit);
        }
        if self.max_priority_fee_per_gas > self.max_fee_per_gas {
            return Err(ValidationError::PriorityFeeAboveMaxFee(
                self.max_priority_fee_per_gas,
                self.max_fee_per_gas,
            ));
        }
        Ok(())
    }

    fn get_address_from_field(data: &Bytes) -> Option<Address> {
        if data.len() < 20 {
            None
        } else {
            Some(Address::from_slice(&data[..20]))
        }
    }

    fn pack_for_hash(&self) -> Vec<u8> {
        (
            self.sender,
            self.nonce,
            keccak256(&self.init_code),
            keccak256(&self.call_data),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            keccak256(&self.paymaster_and_data),
        )
            .abi_encode()
    }

    fn entity_address(&self, entity: EntityType) -> Option<Address> {
        match entity {
            EntityType::Account => Some(self.sender),
            EntityType::Paymaster => self.paymaster(),
            EntityType::Factory => self.factory(),
            EntityType::Aggregator => None,
        }
    }
}
