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

use alloy_primitives::Bytes;
use blst::{
    min_pk::{AggregateSignature, PublicKey, Signature},
    BLST_ERROR,
};
use quay_types::aggregator::{CurveError, CurveOps};

/// Proof of possession domain separation tag
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// BLS12-381 with public keys in G1 and signatures in G2, backed by `blst`
#[derive(Debug, Default, Clone, Copy)]
pub struct BlstCurve;

impl CurveOps for BlstCurve {
    fn aggregate_signatures(&self, signatures: &[Bytes]) -> Result<Bytes, CurveError> {
        if signatures.is_empty() {
            return Err(CurveError("no signatures to aggregate".to_string()));
        }
        let signatures = signatures
            .iter()
            .enumerate()
            .map(|(i, sig)| {
                Signature::from_bytes(sig)
                    .map_err(|e| CurveError(format!("signature {i} does not parse: {e:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&Signature> = signatures.iter().collect();
        let aggregate = AggregateSignature::aggregate(&refs, true)
            .map_err(|e| CurveError(format!("aggregation failed: {e:?}")))?;
        Ok(Bytes::copy_from_slice(&aggregate.to_signature().to_bytes()))
    }

    fn verify_aggregate(
        &self,
        aggregate: &[u8],
        public_keys: &[Bytes],
        messages: &[Bytes],
    ) -> bool {
        if public_keys.is_empty() || public_keys.len() != messages.len() {
            return false;
        }
        let Ok(signature) = Signature::from_bytes(aggregate) else {
            return false;
        };
        let Ok(public_keys) = public_keys
            .iter()
            .map(|pk| PublicKey::from_bytes(pk))
            .collect::<Result<Vec<_>, _>>()
        else {
            return false;
        };
        let pk_refs: Vec<&PublicKey> = public_keys.iter().collect();
        let messages: Vec<&[u8]> = messages.iter().map(|m| m.as_ref()).collect();
        signature.aggregate_verify(true, &messages, BLS_DST, &pk_refs, true)
            == BLST_ERROR::BLST_SUCCESS
    }
}
