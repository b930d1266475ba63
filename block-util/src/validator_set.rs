use sha2::{Digest, Sha256};

use crate::crypto::SignatureVerifier;

pub type ValidatorWeight = u64;

/// `(pubkey, adnl-id?, weight)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorDescr {
    pub pubkey: [u8; 32],
    pub adnl_id: Option<[u8; 32]>,
    pub weight: ValidatorWeight,
}

/// An ordered validator list for a `(shard, catchain_seqno)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    pub catchain_seqno: u32,
    validators: Vec<ValidatorDescr>,
    total_weight: ValidatorWeight,
    hash: u32,
}

impl ValidatorSet {
    pub fn new(catchain_seqno: u32, validators: Vec<ValidatorDescr>) -> Self {
        let total_weight = validators.iter().map(|v| v.weight).sum();
        let hash = Self::compute_hash(catchain_seqno, &validators);
        Self {
            catchain_seqno,
            validators,
            total_weight,
            hash,
        }
    }

    pub fn validators(&self) -> &[ValidatorDescr] {
        &self.validators
    }

    pub fn total_weight(&self) -> ValidatorWeight {
        self.total_weight
    }

    /// A structural fingerprint of `(catchain_seqno, validators)`, used to
    /// decide whether an incoming candidate/proof targets this exact set.
    pub fn validator_set_hash(&self) -> u32 {
        self.hash
    }

    fn compute_hash(catchain_seqno: u32, validators: &[ValidatorDescr]) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(catchain_seqno.to_le_bytes());
        for v in validators {
            hasher.update(v.pubkey);
            hasher.update(v.weight.to_le_bytes());
        }
        let digest = hasher.finalize();
        u32::from_le_bytes(digest[..4].try_into().unwrap())
    }

    /// Verifies every signature in `signatures` against `message` and returns
    /// the accumulated weight, or a descriptive error on the first invalid
    /// signature.
    pub fn check_signatures(
        &self,
        message: &[u8],
        signatures: &SignatureSet,
        verifier: &dyn SignatureVerifier,
    ) -> Result<ValidatorWeight, SignatureCheckError> {
        let mut weight = 0u64;
        for (validator_id, signature) in &signatures.entries {
            let descr = self
                .validators
                .iter()
                .find(|v| &v.pubkey == validator_id)
                .ok_or(SignatureCheckError::UnknownValidator(*validator_id))?;
            if !verifier.verify(validator_id, message, signature) {
                return Err(SignatureCheckError::BadSignature(*validator_id));
            }
            weight += descr.weight;
        }
        Ok(weight)
    }
}

/// A set of `(validator-id -> signature)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureSet {
    pub entries: Vec<([u8; 32], [u8; 64])>,
}

impl SignatureSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureCheckError {
    #[error("signature from unknown validator {0:02x?}")]
    UnknownValidator([u8; 32]),
    #[error("invalid signature from validator {0:02x?}")]
    BadSignature([u8; 32]),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AcceptAllVerifier;

    fn validators(n: u8) -> Vec<ValidatorDescr> {
        (0..n)
            .map(|i| ValidatorDescr {
                pubkey: [i; 32],
                adnl_id: None,
                weight: 1,
            })
            .collect()
    }

    #[test]
    fn weight_accumulates_per_signer() {
        let set = ValidatorSet::new(1, validators(3));
        let sigs = SignatureSet {
            entries: vec![([0; 32], [0; 64]), ([1; 32], [0; 64])],
        };
        let weight = set.check_signatures(b"msg", &sigs, &AcceptAllVerifier).unwrap();
        assert_eq!(weight, 2);
    }

    #[test]
    fn unknown_validator_is_rejected() {
        let set = ValidatorSet::new(1, validators(1));
        let sigs = SignatureSet {
            entries: vec![([9; 32], [0; 64])],
        };
        assert!(set.check_signatures(b"msg", &sigs, &AcceptAllVerifier).is_err());
    }
}
