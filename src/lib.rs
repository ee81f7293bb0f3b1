//! # devchain: an embeddable Ethereum-compatible development chain
//!
//! - In short, devchain is a single-node chain you can hold in a test: it accepts signed
//!   transactions, seals them into blocks right away (or when you say so), keeps receipts and
//!   logs around for lookups and filters, and lets you snapshot and rewind the whole thing.
//!
//! - There is no consensus, no networking and no mempool. Blocks are sealed by a local policy
//!   ([config::MiningMode]) and the only clock is the wall clock plus whatever offset the test
//!   added with [DevChainNode::increase_time](node/struct.DevChainNode.html#method.increase_time).
//!
//! # Overview
//! The crate is a stack of small modules, each usable on its own:
//!
//! - [common]: the basic types (`Wei`, `Addr`, `Hash`, `Bytes`, `Bloom`) and helpers.
//! - [state]: the versioned in-memory account store with O(1) snapshots.
//! - [codec]: the binary (RLP) encodings of every persisted record, with strict decoding.
//! - [tx]: signed transactions (legacy/EIP-155 and EIP-1559), signing and sender recovery.
//! - [processor]: validation, gas accounting and value transfer of a single transaction; code is
//!   delegated to a pluggable [processor::Executor].
//! - [block]: the block context and the pending block builder that seals blocks.
//! - [chain]: the canonical chain and its indices (transactions, receipts, logs, states).
//! - [filter]: log/block/pending-transaction filters polled by high-water mark.
//! - [storage]: a key/value persistence adapter the node writes sealed blocks through.
//! - [node]: [DevChainNode](node/struct.DevChainNode.html), which ties everything together.
//!
//! Running a transaction takes a few steps:
//!
//! - Build a node with [DevChainNode::new](node/struct.DevChainNode.html#method.new) from a
//!   [DevChainConfig](config/struct.DevChainConfig.html) (`{}` is a valid JSON config).
//! - Call `start` with the accounts to prefund; this seals genesis.
//! - Sign a [TxRequest](tx/struct.TxRequest.html) and hand it to `send_transaction`. With the
//!   default instant mining the block is sealed before the call returns.
//!
//! # On the Data Flow
//! Every mutation goes through one async lock over the *working* state: an [state::MemState]
//! whose writes sit in overlays on top of the last committed revision. A transaction runs inside
//! a snapshot of the working state, so a revert just drops the overlays that came after it. When
//! a block is sealed the overlays are squashed into a new committed revision, and that revision
//! is published, together with the block, in a single write of the chain lock. Readers only see
//! committed revisions; they clone an `Arc` and never wait on execution.
//!
//! ```notrust
//!     send_transaction ──> [ processor ] ──> [ PendingBlock ]
//!                              |  ^                 |
//!                       (write)|  |(read)      finalize()
//!                              v  |                 v
//!                         [ MemState overlays ] ─ commit() ─> [ committed view ]
//!                                                                   |
//!                                  readers <── [ Chain ] <── add_block() ──> [ storage ]
//! ```

#[macro_use]
pub mod common;
pub mod block;
pub mod chain;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod node;
pub mod processor;
pub mod receipt;
pub mod state;
pub mod storage;
pub mod tx;

pub use config::DevChainConfig;
pub use error::{ChainError, ChainResult};
pub use node::DevChainNode;
