//! Merkle-proof and signature verification of spec.md §4.4, grounded on
//! `original_source/validator/impl/check-proof.hpp/.cpp`.
//!
//! Cell-level merkle proof virtualization is out of scope (spec.md §1): the
//! `Proof`/`ProofLink` abstractions in `shardval-block-util` already expose
//! the extracted header, so this module's job is the structural sanity
//! checks, validator-set matching, and signature-weight accounting spec.md
//! describes — not the cell walk itself.

use shardval_block_util::{BlockHandle, BlockHeader, BlockIdExt, Proof, ProofLink, SignatureVerifier, ValidatorSet};

use crate::error::{CoreError, CoreResult};

/// Which reference the master proof is checked against (spec.md §4.4
/// "Modes"). Deriving a `ValidatorSet` from a masterchain state or a key
/// block's embedded config is below this module's boundary (spec.md §6: the
/// core only requires that a block body admit `extract_from_key_block`);
/// callers resolve the set and hand it in.
pub enum ProofCheckMode {
    /// Master proof against the locally held master state's validator set.
    Normal { validator_set: ValidatorSet },
    /// Master proof against an explicit, older reference master state. The
    /// reference must predate the block and claim the same
    /// `prev_key_mc_seqno` the proof's header declares.
    RelState { reference_unix_time: u32, reference_prev_key_mc_seqno: u32, validator_set: ValidatorSet },
    /// Master proof against a previous key block's proof-link, which must
    /// itself be a key block at the expected seqno.
    RelProof { key_block_proof: ProofLink, expected_key_seqno: u32, validator_set: ValidatorSet },
}

/// Populates a handle's structural fields from a checked header. Shared by
/// `check_proof` and `check_proof_link` so both populate the identical field
/// set (spec.md §8's round-trip law).
pub fn populate_handle(handle: &BlockHandle, header: &BlockHeader) -> CoreResult<()> {
    handle.set_split(header.after_split)?;
    handle.set_merge(header.after_merge)?;
    handle.set_is_key_block(header.is_key_block)?;
    handle.set_state_root_hash(header.state_update.new_hash)?;
    handle.set_logical_time(header.end_lt)?;
    if handle.id().seqno() > 0 {
        handle.set_unix_time(header.gen_utime)?;
    }
    for prev in &header.prev {
        handle.set_prev(*prev)?;
    }
    Ok(())
}

fn structural_sanity(id: &BlockIdExt, header: &BlockHeader) -> CoreResult<()> {
    if header.after_split && header.after_merge {
        return Err(CoreError::proto_violation(format!("{id}: both after_split and after_merge set")));
    }
    if id.is_masterchain() && (header.after_split || header.after_merge) {
        return Err(CoreError::proto_violation(format!("{id}: masterchain block cannot split or merge")));
    }
    if header.after_split && id.shard().shard_parent().is_none() {
        return Err(CoreError::proto_violation(format!("{id}: after_split at an empty shard prefix")));
    }
    if header.is_key_block && !id.is_masterchain() {
        return Err(CoreError::proto_violation(format!("{id}: key block flag set on a non-masterchain block")));
    }
    let expected_prev_count = if header.after_merge { 2 } else { 1 };
    if id.seqno() > 0 && header.prev.len() != expected_prev_count {
        return Err(CoreError::proto_violation(format!(
            "{id}: expected {expected_prev_count} predecessor(s), got {}",
            header.prev.len()
        )));
    }
    Ok(())
}

/// Checks a master block's `Proof`: structural sanity, validator set
/// agreement, and the declared signature weight against what actually
/// verifies.
pub fn check_proof(mode: &ProofCheckMode, proof: &Proof, verifier: &dyn SignatureVerifier) -> CoreResult<BlockHeader> {
    if !proof.id.is_masterchain() {
        return Err(CoreError::proto_violation(format!("{}: check_proof is masterchain-only", proof.id)));
    }
    structural_sanity(&proof.id, &proof.header)?;

    let validator_set = match mode {
        ProofCheckMode::Normal { validator_set } => validator_set,
        ProofCheckMode::RelState { reference_unix_time, reference_prev_key_mc_seqno, validator_set } => {
            if *reference_unix_time >= proof.header.gen_utime {
                return Err(CoreError::proto_violation(format!(
                    "{}: reference master state is not older than the block",
                    proof.id
                )));
            }
            if *reference_prev_key_mc_seqno != proof.header.prev_key_mc_seqno {
                return Err(CoreError::proto_violation(format!(
                    "{}: reference state's prev_key_mc_seqno does not match the proof's",
                    proof.id
                )));
            }
            validator_set
        }
        ProofCheckMode::RelProof { key_block_proof, expected_key_seqno, validator_set } => {
            if !key_block_proof.header.is_key_block {
                return Err(CoreError::proto_violation(format!(
                    "{}: reference proof-link {} is not a key block",
                    proof.id, key_block_proof.id
                )));
            }
            if key_block_proof.id.seqno() != *expected_key_seqno {
                return Err(CoreError::proto_violation(format!(
                    "{}: reference key block seqno mismatch: expected {}, got {}",
                    proof.id,
                    expected_key_seqno,
                    key_block_proof.id.seqno()
                )));
            }
            validator_set
        }
    };

    if validator_set.catchain_seqno != proof.header.catchain_seqno {
        return Err(CoreError::proto_violation(format!(
            "{}: catchain_seqno mismatch: set has {}, proof declares {}",
            proof.id, validator_set.catchain_seqno, proof.header.catchain_seqno
        )));
    }
    if validator_set.validator_set_hash() != proof.header.validator_set_hash {
        return Err(CoreError::proto_violation(format!("{}: validator_set_hash mismatch", proof.id)));
    }

    let message = proof_signing_message(&proof.id, &proof.header);
    let weight = validator_set
        .check_signatures(&message, &proof.signatures, verifier)
        .map_err(|e| CoreError::proto_violation(e.to_string()))?;
    if weight != proof.sig_weight {
        return Err(CoreError::proto_violation(format!(
            "{}: total signature weight mismatch: declared {}, actual {}",
            proof.id, proof.sig_weight, weight
        )));
    }

    Ok(proof.header.clone())
}

/// Checks a non-master block's `ProofLink`: structural integrity only, no
/// signature verification (spec.md §4.4 mode `prooflink`).
pub fn check_proof_link(link: &ProofLink) -> CoreResult<BlockHeader> {
    if link.id.is_masterchain() {
        return Err(CoreError::proto_violation(format!("{}: check_proof_link rejects masterchain blocks", link.id)));
    }
    structural_sanity(&link.id, &link.header)?;
    Ok(link.header.clone())
}

fn proof_signing_message(id: &BlockIdExt, header: &BlockHeader) -> Vec<u8> {
    let mut msg = Vec::with_capacity(64);
    msg.extend_from_slice(&id.root_hash);
    msg.extend_from_slice(&id.file_hash);
    msg.extend_from_slice(&header.end_lt.to_le_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use shardval_block_util::{AcceptAllVerifier, BlockId, ShardIdent, SignatureSet, StateUpdate, ValidatorDescr};

    use super::*;

    fn master_id(seqno: u32) -> BlockIdExt {
        BlockIdExt {
            id: BlockId { shard: ShardIdent::new_full(-1), seqno },
            root_hash: [seqno as u8; 32],
            file_hash: [seqno as u8 + 1; 32],
        }
    }

    fn header(catchain_seqno: u32, validator_set_hash: u32, is_key_block: bool) -> BlockHeader {
        BlockHeader {
            prev: vec![master_id(0)],
            master_ref: None,
            before_split: false,
            after_split: false,
            after_merge: false,
            want_split: false,
            want_merge: false,
            is_key_block,
            gen_utime: 100,
            end_lt: 1000,
            state_update: StateUpdate { old_hash: [0; 32], new_hash: [9; 32] },
            catchain_seqno,
            validator_set_hash,
            prev_key_mc_seqno: 0,
        }
    }

    fn validators() -> Vec<ValidatorDescr> {
        (0..3).map(|i| ValidatorDescr { pubkey: [i; 32], adnl_id: None, weight: 1 }).collect()
    }

    #[test]
    fn valid_master_proof_populates_header_fields() {
        let set = ValidatorSet::new(5, validators());
        let id = master_id(1);
        let header = header(5, set.validator_set_hash(), false);
        let msg = proof_signing_message(&id, &header);
        let sigs = SignatureSet {
            entries: validators().iter().map(|v| (v.pubkey, {
                let _ = &msg;
                [0u8; 64]
            })).collect(),
        };
        let weight = set.check_signatures(&msg, &sigs, &AcceptAllVerifier).unwrap();
        let proof = Proof { id, header: header.clone(), signatures: sigs, sig_weight: weight };

        let checked = check_proof(&ProofCheckMode::Normal { validator_set: set }, &proof, &AcceptAllVerifier).unwrap();
        assert_eq!(checked.catchain_seqno, 5);
    }

    #[test]
    fn wrong_catchain_seqno_is_rejected() {
        let set = ValidatorSet::new(5, validators());
        let id = master_id(1);
        let header = header(41, set.validator_set_hash(), false);
        let proof = Proof { id, header, signatures: SignatureSet::default(), sig_weight: 0 };
        let err = check_proof(&ProofCheckMode::Normal { validator_set: set }, &proof, &AcceptAllVerifier).unwrap_err();
        assert!(matches!(err, CoreError::ProtoViolation(_)));
    }

    #[test]
    fn declared_weight_mismatch_is_rejected() {
        let set = ValidatorSet::new(5, validators());
        let id = master_id(1);
        let header = header(5, set.validator_set_hash(), false);
        let sigs = SignatureSet { entries: vec![([0; 32], [0; 64])] };
        let proof = Proof { id, header, signatures: sigs, sig_weight: 99 };
        let err = check_proof(&ProofCheckMode::Normal { validator_set: set }, &proof, &AcceptAllVerifier).unwrap_err();
        assert!(matches!(err, CoreError::ProtoViolation(_)));
    }

    #[test]
    fn after_split_and_after_merge_together_is_rejected_structurally() {
        let link = ProofLink {
            id: BlockIdExt {
                id: BlockId { shard: ShardIdent::new_full(0), seqno: 1 },
                root_hash: [1; 32],
                file_hash: [2; 32],
            },
            header: BlockHeader { after_split: true, after_merge: true, ..header(0, 0, false) },
        };
        assert!(check_proof_link(&link).is_err());
    }

    #[test]
    fn master_proof_link_is_rejected_by_check_proof_link() {
        let link = ProofLink { id: master_id(1), header: header(0, 0, false) };
        assert!(check_proof_link(&link).is_err());
    }
}
