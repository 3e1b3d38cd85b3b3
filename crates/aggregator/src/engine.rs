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

use alloy_primitives::{Address, Bytes};
use quay_types::{
    aggregator::{
        AggregatorCosts, CurveError, MessageHasher, SchemeId, SignatureAggregator,
        SignatureAggregatorError, SignatureAggregatorResult,
    },
    UserOperation,
};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    costs::{CostModel, LinearCostModel},
    registry::AggregatorRegistration,
};

/// Aggregates and verifies signatures for one registered aggregator.
///
/// Each operation's signature field is `signature || public key`. The
/// aggregated blob is `aggregate signature || pk_1 || ... || pk_n` in batch
/// order.
#[derive(Clone)]
pub struct SchemeAggregator {
    registration: Arc<AggregatorRegistration>,
    chain_id: u64,
    hasher: Arc<dyn MessageHasher>,
    cost_model: Arc<dyn CostModel>,
}

impl fmt::Debug for SchemeAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemeAggregator")
            .field("registration", &self.registration)
            .field("chain_id", &self.chain_id)
            .field("hasher", &self.hasher)
            .field("cost_model", &self.cost_model)
            .finish()
    }
}

impl SchemeAggregator {
    /// Engine for `registration`, priced linearly from its published costs
    pub fn new(
        registration: Arc<AggregatorRegistration>,
        chain_id: u64,
        hasher: Arc<dyn MessageHasher>,
    ) -> Self {
        let cost_model = Arc::new(LinearCostModel::new(registration.costs.clone()));
        Self {
            registration,
            chain_id,
            hasher,
            cost_model,
        }
    }

    /// Replace the cost model
    pub fn with_cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// The cost model pricing this aggregator's bundles
    pub fn cost_model(&self) -> &dyn CostModel {
        &*self.cost_model
    }

    /// Aggregate the signatures of `ops` into one blob
    pub fn aggregate(&self, ops: &[UserOperation]) -> SignatureAggregatorResult<Bytes> {
        self.aggregate_cancellable(ops, &CancellationToken::new())
    }

    /// [`Self::aggregate`], giving up with `Cancelled` once `cancel` fires
    pub fn aggregate_cancellable(
        &self,
        ops: &[UserOperation],
        cancel: &CancellationToken,
    ) -> SignatureAggregatorResult<Bytes> {
        if ops.is_empty() {
            return Err(SignatureAggregatorError::EmptyBatch);
        }
        check(cancel)?;
        let pairs = self.extract(ops)?;
        check(cancel)?;

        let (signatures, public_keys): (Vec<Bytes>, Vec<Bytes>) = pairs.into_iter().unzip();
        let aggregate = self.registration.curve.aggregate_signatures(&signatures)?;
        check(cancel)?;

        let layout = self.registration.layout;
        if aggregate.len() != layout.signature_size {
            return Err(CurveError(format!(
                "aggregate has {} bytes, expected {}",
                aggregate.len(),
                layout.signature_size
            ))
            .into());
        }
        let mut blob = Vec::with_capacity(layout.blob_len(ops.len()));
        blob.extend_from_slice(&aggregate);
        for public_key in &public_keys {
            blob.extend_from_slice(public_key);
        }
        debug!(
            "Aggregated {} signatures for {}",
            ops.len(),
            self.registration.address
        );
        Ok(blob.into())
    }

    /// Check `blob` against the operations it claims to cover
    pub fn verify(
        &self,
        ops: &[UserOperation],
        entry_point: Address,
        blob: &[u8],
    ) -> SignatureAggregatorResult<()> {
        self.verify_cancellable(ops, entry_point, blob, &CancellationToken::new())
    }

    /// [`Self::verify`], giving up with `Cancelled` once `cancel` fires
    pub fn verify_cancellable(
        &self,
        ops: &[UserOperation],
        entry_point: Address,
        blob: &[u8],
        cancel: &CancellationToken,
    ) -> SignatureAggregatorResult<()> {
        if ops.is_empty() {
            return Err(SignatureAggregatorError::EmptyBatch);
        }
        self.check_entry_point(entry_point)?;

        let layout = self.registration.layout;
        let expected = layout.blob_len(ops.len());
        if blob.len() != expected {
            return Err(SignatureAggregatorError::SizeMismatch {
                expected,
                actual: blob.len(),
            });
        }
        check(cancel)?;

        let (aggregate, keys) = blob.split_at(layout.signature_size);
        let declared = self.extract(ops)?;
        let public_keys: Vec<Bytes> = keys
            .chunks_exact(layout.public_key_size)
            .map(Bytes::copy_from_slice)
            .collect();
        // the blob must carry exactly the keys the operations declare
        if let Some(index) = declared
            .iter()
            .zip(&public_keys)
            .position(|((_, declared), carried)| declared != carried)
        {
            debug!("Aggregate key {index} does not match its operation");
            return Err(SignatureAggregatorError::InvalidAggregate);
        }
        let messages = self.messages(ops, entry_point);
        check(cancel)?;

        let valid = self
            .registration
            .curve
            .verify_aggregate(aggregate, &public_keys, &messages);
        check(cancel)?;
        if !valid {
            return Err(SignatureAggregatorError::InvalidAggregate);
        }
        Ok(())
    }

    /// Verify one operation's own signature and return its public key
    pub fn validate_single(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> SignatureAggregatorResult<Bytes> {
        self.check_entry_point(entry_point)?;
        let layout = self.registration.layout;
        let (signature, public_key) =
            layout
                .split(&op.signature)
                .ok_or(SignatureAggregatorError::MalformedSignature {
                    index: 0,
                    len: op.signature.len(),
                    min_len: layout.min_len(),
                })?;
        let message = self
            .hasher
            .signing_message(op, entry_point, self.chain_id);
        let public_key = Bytes::copy_from_slice(public_key);
        if !self
            .registration
            .curve
            .verify_aggregate(signature, &[public_key.clone()], &[message])
        {
            return Err(SignatureAggregatorError::InvalidAggregate);
        }
        Ok(public_key)
    }

    fn check_entry_point(&self, entry_point: Address) -> SignatureAggregatorResult<()> {
        if !self.registration.serves(entry_point) {
            return Err(SignatureAggregatorError::UnsupportedEntryPoint(entry_point));
        }
        Ok(())
    }

    // Splits every signature field. The first malformed one, in batch order, is reported.
    fn extract(&self, ops: &[UserOperation]) -> SignatureAggregatorResult<Vec<(Bytes, Bytes)>> {
        let layout = self.registration.layout;
        let pairs: Vec<Option<(Bytes, Bytes)>> = ops
            .par_iter()
            .map(|op| {
                layout.split(&op.signature).map(|(signature, public_key)| {
                    (
                        Bytes::copy_from_slice(signature),
                        Bytes::copy_from_slice(public_key),
                    )
                })
            })
            .collect();
        if let Some(index) = pairs.iter().position(Option::is_none) {
            return Err(SignatureAggregatorError::MalformedSignature {
                index,
                len: ops[index].signature.len(),
                min_len: layout.min_len(),
            });
        }
        Ok(pairs.into_iter().flatten().collect())
    }

    fn messages(&self, ops: &[UserOperation], entry_point: Address) -> Vec<Bytes> {
        ops.par_iter()
            .map(|op| self.hasher.signing_message(op, entry_point, self.chain_id))
            .collect()
    }
}

fn check(cancel: &CancellationToken) -> SignatureAggregatorResult<()> {
    if cancel.is_cancelled() {
        return Err(SignatureAggregatorError::Cancelled);
    }
    Ok(())
}

impl SignatureAggregator for SchemeAggregator {
    fn address(&self) -> Address {
        self.registration.address
    }

    fn scheme(&self) -> SchemeId {
        self.registration.scheme
    }

    fn costs(&self) -> &AggregatorCosts {
        &self.registration.costs
    }

    fn validate_user_op_signature(
        &self,
        user_op: &UserOperation,
        entry_point: Address,
    ) -> SignatureAggregatorResult<Bytes> {
        self.validate_single(user_op, entry_point)
    }

    fn aggregate_signatures(&self, uos: &[UserOperation]) -> SignatureAggregatorResult<Bytes> {
        self.aggregate(uos)
    }

    fn verify_aggregate(
        &self,
        uos: &[UserOperation],
        entry_point: Address,
        blob: &[u8],
    ) -> SignatureAggregatorResult<()> {
        self.verify(uos, entry_point, blob)
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use quay_types::aggregator::{MockCurveOps, MockMessageHasher, UserOpHashMessage};

    use super::*;
    use crate::bls::test_keys::TestSigner;

    const ENTRY_POINT: Address = Address::repeat_byte(0xee);
    const CHAIN_ID: u64 = 1337;

    fn bls_aggregator() -> SchemeAggregator {
        let registration =
            AggregatorRegistration::bls(Some(Address::repeat_byte(0xa9)), vec![ENTRY_POINT]);
        SchemeAggregator::new(Arc::new(registration), CHAIN_ID, Arc::new(UserOpHashMessage))
    }

    fn mocked_aggregator(curve: MockCurveOps, hasher: MockMessageHasher) -> SchemeAggregator {
        let registration = AggregatorRegistration::new(
            Address::repeat_byte(0xa9),
            SchemeId::Bls12381MinPk,
            Arc::new(curve),
            vec![ENTRY_POINT],
            AggregatorCosts::default(),
        );
        SchemeAggregator::new(Arc::new(registration), CHAIN_ID, Arc::new(hasher))
    }

    fn signed_ops(n: u8) -> Vec<UserOperation> {
        (1..=n)
            .map(|i| {
                let mut op = UserOperation {
                    sender: Address::repeat_byte(i),
                    nonce: U256::from(i),
                    ..Default::default()
                };
                let message = UserOpHashMessage.signing_message(&op, ENTRY_POINT, CHAIN_ID);
                op.signature = TestSigner::random().sign_field(&message);
                op
            })
            .collect()
    }

    fn unsigned_ops(lens: &[usize]) -> Vec<UserOperation> {
        lens.iter()
            .map(|len| UserOperation {
                signature: Bytes::from(vec![1u8; *len]),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn bls_round_trip() {
        let aggregator = bls_aggregator();
        let ops = signed_ops(3);

        let blob = aggregator.aggregate(&ops).unwrap();
        assert_eq!(blob.len(), 96 + 3 * 48);
        assert_eq!(&blob[96..144], &ops[0].signature[96..144]);
        aggregator.verify(&ops, ENTRY_POINT, &blob).unwrap();

        // through the trait object
        let dyn_aggregator: &dyn SignatureAggregator = &aggregator;
        dyn_aggregator
            .verify_aggregate(&ops, ENTRY_POINT, &blob)
            .unwrap();
    }

    #[test]
    fn mutated_public_key_fails() {
        let aggregator = bls_aggregator();
        let ops = signed_ops(2);
        let blob = aggregator.aggregate(&ops).unwrap();

        for position in [96, 96 + 47, 96 + 48 + 20] {
            let mut mutated = blob.to_vec();
            mutated[position] ^= 0x01;
            assert_eq!(
                aggregator.verify(&ops, ENTRY_POINT, &mutated),
                Err(SignatureAggregatorError::InvalidAggregate)
            );
        }
    }

    #[test]
    fn operation_key_must_match_blob() {
        let aggregator = bls_aggregator();
        let ops = signed_ops(2);
        let blob = aggregator.aggregate(&ops).unwrap();

        for (index, position) in [(0, 101), (1, 96), (1, 143)] {
            let mut mutated = ops.clone();
            let mut signature = mutated[index].signature.to_vec();
            signature[position] ^= 0x01;
            mutated[index].signature = signature.into();
            assert_eq!(
                aggregator.verify(&mutated, ENTRY_POINT, &blob),
                Err(SignatureAggregatorError::InvalidAggregate)
            );
        }

        let mut truncated = ops.clone();
        truncated[1].signature = Bytes::from(vec![1u8; 100]);
        assert_eq!(
            aggregator.verify(&truncated, ENTRY_POINT, &blob),
            Err(SignatureAggregatorError::MalformedSignature {
                index: 1,
                len: 100,
                min_len: 144
            })
        );
    }

    #[test]
    fn reordered_operations_fail() {
        let aggregator = bls_aggregator();
        let mut ops = signed_ops(2);
        let blob = aggregator.aggregate(&ops).unwrap();
        ops.swap(0, 1);
        assert_eq!(
            aggregator.verify(&ops, ENTRY_POINT, &blob),
            Err(SignatureAggregatorError::InvalidAggregate)
        );
    }

    #[test]
    fn size_and_entry_point_checks() {
        let aggregator = bls_aggregator();
        let ops = signed_ops(2);
        let blob = aggregator.aggregate(&ops).unwrap();

        assert_eq!(
            aggregator.verify(&ops, ENTRY_POINT, &blob[..blob.len() - 1]),
            Err(SignatureAggregatorError::SizeMismatch {
                expected: 192,
                actual: 191
            })
        );
        assert_eq!(
            aggregator.verify(&ops[..1], ENTRY_POINT, &blob),
            Err(SignatureAggregatorError::SizeMismatch {
                expected: 144,
                actual: 192
            })
        );
        assert_eq!(
            aggregator.verify(&ops, Address::ZERO, &blob),
            Err(SignatureAggregatorError::UnsupportedEntryPoint(Address::ZERO))
        );
        assert_eq!(
            aggregator.aggregate(&[]),
            Err(SignatureAggregatorError::EmptyBatch)
        );
        assert_eq!(
            aggregator.verify(&[], ENTRY_POINT, &[]),
            Err(SignatureAggregatorError::EmptyBatch)
        );
    }

    #[test]
    fn malformed_signature_reports_first_index() {
        let aggregator = bls_aggregator();
        let ops = unsigned_ops(&[144, 100, 10, 200]);
        assert_eq!(
            aggregator.aggregate(&ops),
            Err(SignatureAggregatorError::MalformedSignature {
                index: 1,
                len: 100,
                min_len: 144
            })
        );
    }

    #[test]
    fn validate_single_returns_public_key() {
        let aggregator = bls_aggregator();
        let ops = signed_ops(1);
        let public_key = aggregator.validate_single(&ops[0], ENTRY_POINT).unwrap();
        assert_eq!(public_key.as_ref(), &ops[0].signature[96..144]);

        let mut tampered = ops[0].clone();
        tampered.nonce += U256::from(1);
        assert_eq!(
            aggregator.validate_single(&tampered, ENTRY_POINT),
            Err(SignatureAggregatorError::InvalidAggregate)
        );
        assert_eq!(
            aggregator.validate_single(&ops[0], Address::ZERO),
            Err(SignatureAggregatorError::UnsupportedEntryPoint(Address::ZERO))
        );
    }

    #[test]
    fn curve_failure_surfaces() {
        let mut curve = MockCurveOps::new();
        curve
            .expect_aggregate_signatures()
            .returning(|_| Err(CurveError("boom".to_string())));
        let aggregator = mocked_aggregator(curve, MockMessageHasher::new());

        assert_eq!(
            aggregator.aggregate(&unsigned_ops(&[144])),
            Err(SignatureAggregatorError::Curve(CurveError("boom".to_string())))
        );
    }

    #[test]
    fn short_curve_output_is_an_error() {
        let mut curve = MockCurveOps::new();
        curve
            .expect_aggregate_signatures()
            .returning(|_| Ok(Bytes::from(vec![0u8; 95])));
        let aggregator = mocked_aggregator(curve, MockMessageHasher::new());
        assert!(matches!(
            aggregator.aggregate(&unsigned_ops(&[144])),
            Err(SignatureAggregatorError::Curve(_))
        ));
    }

    #[test]
    fn verify_passes_keys_and_messages_in_order() {
        let mut hasher = MockMessageHasher::new();
        hasher
            .expect_signing_message()
            .returning(|op, _, _| Bytes::copy_from_slice(op.sender.as_slice()));
        let mut curve = MockCurveOps::new();
        curve
            .expect_verify_aggregate()
            .withf(|aggregate: &[u8], public_keys: &[Bytes], messages: &[Bytes]| {
                aggregate == [9u8; 96]
                    && public_keys == [Bytes::from(vec![1u8; 48]), Bytes::from(vec![2u8; 48])]
                    && messages[0].as_ref() == Address::repeat_byte(1).as_slice()
                    && messages[1].as_ref() == Address::repeat_byte(2).as_slice()
            })
            .times(1)
            .returning(|_, _, _| true);
        let aggregator = mocked_aggregator(curve, hasher);

        let ops: Vec<_> = (1..=2u8)
            .map(|i| {
                let mut signature = vec![0u8; 96];
                signature.extend_from_slice(&[i; 48]);
                UserOperation {
                    sender: Address::repeat_byte(i),
                    signature: signature.into(),
                    ..Default::default()
                }
            })
            .collect();
        let mut blob = vec![9u8; 96];
        blob.extend_from_slice(&[1u8; 48]);
        blob.extend_from_slice(&[2u8; 48]);
        aggregator.verify(&ops, ENTRY_POINT, &blob).unwrap();
    }

    #[test]
    fn cancelled_before_curve_work() {
        let mut curve = MockCurveOps::new();
        curve.expect_aggregate_signatures().never();
        curve.expect_verify_aggregate().never();
        let aggregator = mocked_aggregator(curve, MockMessageHasher::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            aggregator.aggregate_cancellable(&unsigned_ops(&[144]), &cancel),
            Err(SignatureAggregatorError::Cancelled)
        );
        assert_eq!(
            aggregator.verify_cancellable(&unsigned_ops(&[144]), ENTRY_POINT, &[0u8; 144], &cancel),
            Err(SignatureAggregatorError::Cancelled)
        );
    }

    #[test]
    fn linear_costs_from_registration() {
        let aggregator = bls_aggregator();
        assert_eq!(aggregator.cost_model().execution_gas(2), 125_000 + 2 * 120_000);
        assert_eq!(aggregator.cost_model().signature_length(2), 192);
    }
}
