//! Domain types for block identity, shard topology, and the abstract
//! block/proof/state values addressed by `BlockIdExt`.
//!
//! Cell-level encoding (BOC, merkle proofs, cell GC) is out of scope for this
//! workspace — these types model the *contract* the validator core relies on,
//! not the wire format.

pub mod block;
pub mod crypto;
pub mod handle;
pub mod message;
pub mod shard;
pub mod state;
pub mod top_block;
pub mod validator_set;

pub use block::{Block, BlockHeader, Proof, ProofLink, StateUpdate};
pub use crypto::{AcceptAllVerifier, SignatureVerifier};
pub use handle::{BlockHandle, HandleError, HandleRecord};
pub use message::{ExternalMessage, IhrMessage, MessageId};
pub use shard::{BlockId, BlockIdExt, ShardIdent, MASTERCHAIN_ID};
pub use state::{MessageQueue, ShardState};
pub use top_block::{MasterchainConfigView, MasterchainShardView, ShardFsmState, ShardTopBlockDescription};
pub use validator_set::{SignatureCheckError, SignatureSet, ValidatorDescr, ValidatorSet, ValidatorWeight};
