//! The collator query envelope of spec.md §6: a `QueryClient`/`QueryService`
//! trait pair standing in for ADNL/RLDP/overlays, which sit below the query
//! envelope and are out of scope (spec.md §1).
//!
//! Modeled after the teacher's `tycho_network::Service<Request>` shape
//! (request in, response or error out) without its boxed-future
//! type-erasure machinery — this crate's surface is small enough that a
//! plain `async_trait` pair reads more naturally than `BoxCloneService`.

pub mod collator;

pub use collator::{Candidate, CollateRequest, CollateResponse, CollatorError, Ping, Pong, RequestBlockCallback};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query to {0:02x?} timed out")]
    Timeout([u8; 32]),
    #[error("no route to peer {0:02x?}")]
    Unreachable([u8; 32]),
    #[error("peer {0:02x?} returned a malformed response: {1}")]
    Malformed([u8; 32], String),
}

/// The collation manager's outbound view: send a query to a given collator
/// peer, await its response.
#[async_trait]
pub trait QueryClient: Send + Sync + 'static {
    async fn collate_block(&self, peer: [u8; 32], request: CollateRequest) -> Result<CollateResponse, QueryError>;

    async fn request_block_callback(
        &self,
        peer: [u8; 32],
        request: RequestBlockCallback,
    ) -> Result<bytes::Bytes, QueryError>;

    async fn ping(&self, peer: [u8; 32], ping: Ping) -> Result<Pong, QueryError>;
}

/// The collator node's inbound view: handle a query arriving from a
/// validator, identified by its source pubkey.
#[async_trait]
pub trait QueryService: Send + Sync + 'static {
    async fn on_collate_block(&self, source: [u8; 32], request: CollateRequest) -> CollateResponse;

    async fn on_request_block_callback(
        &self,
        source: [u8; 32],
        request: RequestBlockCallback,
    ) -> Result<bytes::Bytes, CollatorError>;

    async fn on_ping(&self, source: [u8; 32], ping: Ping) -> Pong;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use shardval_block_util::{BlockId, BlockIdExt, ShardIdent};

    use super::*;

    struct EchoingCollator {
        pong_version: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl QueryService for EchoingCollator {
        async fn on_collate_block(&self, source: [u8; 32], request: CollateRequest) -> CollateResponse {
            self.calls.fetch_add(1, Ordering::Relaxed);
            CollateResponse::Candidate(Candidate {
                source_pubkey: source,
                id: BlockIdExt {
                    id: BlockId { shard: request.shard, seqno: request.round },
                    root_hash: [1; 32],
                    file_hash: [1; 32],
                },
                collated_data_hash: [0; 32],
                data: bytes::Bytes::new(),
                collated_data: bytes::Bytes::new(),
            })
        }

        async fn on_request_block_callback(
            &self,
            _source: [u8; 32],
            _request: RequestBlockCallback,
        ) -> Result<bytes::Bytes, CollatorError> {
            Err(CollatorError { code: 404, message: "not cached".to_owned() })
        }

        async fn on_ping(&self, _source: [u8; 32], ping: Ping) -> Pong {
            Pong { version: self.pong_version, flags: ping.flags }
        }
    }

    #[tokio::test]
    async fn service_answers_collate_request_with_matching_shard_and_round() {
        let service = EchoingCollator { pong_version: 7, calls: AtomicU32::new(0) };
        let request = CollateRequest {
            shard: ShardIdent::new_full(0),
            catchain_seqno: 1,
            prev: Vec::new(),
            creator_pubkey: [2; 32],
            round: 42,
            first_block_round: 42,
            priority: 0,
            optimistic_prev: None,
        };
        let response = service.on_collate_block([9; 32], request).await;
        match response {
            CollateResponse::Candidate(candidate) => {
                assert_eq!(candidate.source_pubkey, [9; 32]);
                assert_eq!(candidate.id.seqno(), 42);
            }
            CollateResponse::Error(err) => panic!("unexpected error: {err}"),
        }
        assert_eq!(service.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn ping_echoes_flags_with_service_version() {
        let service = EchoingCollator { pong_version: 3, calls: AtomicU32::new(0) };
        let pong = service.on_ping([0; 32], Ping { flags: 0b101 }).await;
        assert_eq!(pong.version, 3);
        assert_eq!(pong.flags, 0b101);
    }
}
