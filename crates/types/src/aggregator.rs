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

//! Signature aggregator types and the capabilities aggregation runs against

use std::fmt::Debug;

use alloy_primitives::{Address, Bytes};
#[cfg(feature = "test-utils")]
use mockall::automock;
use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::UserOperation;

/// Closed set of signature schemes the bundler can aggregate
#[derive(Display, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display(style = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SchemeId {
    /// BLS12-381, 48 byte G1 public keys and 96 byte G2 signatures
    Bls12381MinPk,
}

impl SchemeId {
    /// Byte layout of per-operation signatures under this scheme
    pub fn layout(self) -> SignatureLayout {
        match self {
            SchemeId::Bls12381MinPk => SignatureLayout {
                signature_size: 96,
                public_key_size: 48,
            },
        }
    }
}

/// Per-operation signature layout: `signature || public key`, trailing bytes ignored
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SignatureLayout {
    /// Length of one signature
    pub signature_size: usize,
    /// Length of one public key
    pub public_key_size: usize,
}

impl SignatureLayout {
    /// Shortest signature field that carries a signature and a key
    pub fn min_len(&self) -> usize {
        self.signature_size + self.public_key_size
    }

    /// Length of an aggregated blob over `n` operations
    pub fn blob_len(&self, n: usize) -> usize {
        self.signature_size + n * self.public_key_size
    }

    /// Splits an operation's signature field into its signature and public key
    pub fn split<'a>(&self, signature: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        if signature.len() < self.min_len() {
            return None;
        }
        let (sig, rest) = signature.split_at(self.signature_size);
        Some((sig, &rest[..self.public_key_size]))
    }
}

/// Costs associated with an aggregator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregatorCosts {
    /// Fixed gas of the aggregator's `validateSignatures` function
    pub execution_fixed_gas: u128,
    /// Variable gas of the aggregator's `validateSignatures` function
    pub execution_variable_gas: u128,
    /// Fixed length of the aggregated signature
    pub sig_fixed_length: u128,
    /// Variable length of the aggregated signature
    pub sig_variable_length: u128,
}

/// Failure inside a curve library
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("curve operation failed: {0}")]
pub struct CurveError(pub String);

/// Signature aggregator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureAggregatorError {
    /// An operation's signature is shorter than the scheme's layout
    #[error("Malformed signature at index {index}: {len} bytes, need at least {min_len}")]
    MalformedSignature {
        /// Position of the operation in the batch
        index: usize,
        /// Length found
        len: usize,
        /// Length required
        min_len: usize,
    },
    /// The aggregated blob does not match the batch size
    #[error("Aggregate blob has {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Length for the given batch
        expected: usize,
        /// Length found
        actual: usize,
    },
    /// The aggregate does not verify
    #[error("Aggregate signature is invalid")]
    InvalidAggregate,
    /// Nothing to aggregate
    #[error("Cannot aggregate an empty batch")]
    EmptyBatch,
    /// Aggregator is not supported
    #[error("Unsupported aggregator: {0}")]
    UnsupportedAggregator(Address),
    /// The aggregator does not serve this entry point
    #[error("Unsupported entry point: {0}")]
    UnsupportedEntryPoint(Address),
    /// Curve library failure
    #[error(transparent)]
    Curve(#[from] CurveError),
    /// The caller cancelled the request
    #[error("Aggregation cancelled")]
    Cancelled,
}

/// Result type for signature aggregator functions
pub type SignatureAggregatorResult<T> = Result<T, SignatureAggregatorError>;

/// Elliptic curve operations an aggregation scheme needs
#[auto_impl::auto_impl(&, Arc, Box)]
#[cfg_attr(feature = "test-utils", automock)]
pub trait CurveOps: Send + Sync + Debug {
    /// Combine signatures into one aggregate
    fn aggregate_signatures(&self, signatures: &[Bytes]) -> Result<Bytes, CurveError>;

    /// Check an aggregate against one public key and message per signer.
    ///
    /// Unparseable inputs verify as `false`.
    fn verify_aggregate(
        &self,
        aggregate: &[u8],
        public_keys: &[Bytes],
        messages: &[Bytes],
    ) -> bool;
}

/// Derives the message a user operation's signer signed
#[auto_impl::auto_impl(&, Arc, Box)]
#[cfg_attr(feature = "test-utils", automock)]
pub trait MessageHasher: Send + Sync + Debug {
    /// Message bytes for `op`
    fn signing_message(&self, op: &UserOperation, entry_point: Address, chain_id: u64) -> Bytes;
}

/// Signs over the 32 byte user operation hash
#[derive(Debug, Default, Clone, Copy)]
pub struct UserOpHashMessage;

impl MessageHasher for UserOpHashMessage {
    fn signing_message(&self, op: &UserOperation, entry_point: Address, chain_id: u64) -> Bytes {
        Bytes::copy_from_slice(op.hash(entry_point, chain_id).as_slice())
    }
}

/// Attributes a signature to a registered aggregator by shape alone
#[auto_impl::auto_impl(&, Arc, Box)]
#[cfg_attr(feature = "test-utils", automock)]
pub trait SchemeDetector: Send + Sync {
    /// Address of the aggregator whose scheme fits `signature`
    fn detect_scheme(&self, signature: &[u8]) -> Option<Address>;
}

/// Trait for signature aggregators
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait SignatureAggregator: Send + Sync + Debug {
    /// Onchain address of the aggregator
    fn address(&self) -> Address;

    /// Scheme the aggregator implements
    fn scheme(&self) -> SchemeId;

    /// Costs associated with the aggregator
    fn costs(&self) -> &AggregatorCosts;

    /// Verify one operation's own signature, returning its public key
    fn validate_user_op_signature(
        &self,
        user_op: &UserOperation,
        entry_point: Address,
    ) -> SignatureAggregatorResult<Bytes>;

    /// Aggregate the signatures of several operations into one blob
    fn aggregate_signatures(&self, uos: &[UserOperation]) -> SignatureAggregatorResult<Bytes>;

    /// Verify an aggregated blob against the operations it covers
    fn verify_aggregate(
        &self,
        uos: &[UserOperation],
        entry_point: Address,
        blob: &[u8],
    ) -> SignatureAggregatorResult<()>;
}
