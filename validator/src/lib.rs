//! Per-shard block production and acceptance core (spec.md's overview): the
//! collaborators a masterchain/shardchain validator node needs above
//! storage and below consensus — block-handle bookkeeping, wait-for
//! deduplication, apply-block orchestration, proof checking, the
//! candidates/external-message/shard-top-block buffers, collation dispatch,
//! per-session Validator Groups, and the central Validator Manager that
//! wires all of the above to the current masterchain tip.
//!
//! Cell/BOC encoding, the account-state and block-economics model, and the
//! ADNL/RLDP/overlay transport are out of scope (spec.md §1) — this crate
//! models the orchestration contract above them, consumed through the
//! [`shardval_storage::Storage`] and [`shardval_network`] trait boundaries.

pub mod apply_block;
pub mod candidates_buffer;
pub mod check_proof;
pub mod collation_manager;
pub mod error;
pub mod ext_message_pool;
pub mod ihr_message_pool;
pub mod options;
pub mod shard_top_block_buffer;
pub mod stats;
pub mod validator_group;
pub mod validator_manager;
pub mod wait_for;

pub use apply_block::ApplyBlockOrchestrator;
pub use candidates_buffer::CandidatesBuffer;
pub use check_proof::{check_proof, check_proof_link, populate_handle, ProofCheckMode};
pub use collation_manager::CollationManager;
pub use error::{CoreError, CoreResult};
pub use ext_message_pool::{CheckExternalMessage, ExtMessageError, ExternalMessagePool};
pub use ihr_message_pool::IhrMessagePool;
pub use options::{CollatorsListEntry, SelectMode, ValidatorManagerOptions};
pub use shard_top_block_buffer::ShardTopBlockBuffer;
pub use stats::Stats;
pub use validator_group::{session_id_fingerprint, BlockBodyCodec, ValidateBlockCandidate, ValidatorGroup, ValidatorGroupInfo};
pub use validator_manager::{ConfigViewFactory, LocalCollate, TipCallback, ValidatorManager, WireQuery, WireResponse};
pub use wait_for::{BlockDataSource, BlockWaiters, WaitForRegistry};
