//! Error kinds surfaced by the node.
//!
//! Structural misuse is a hard [ChainError]. Transaction validation failures
//! are not errors at this level: they come back inside an
//! [ExecutionResult](crate::processor::ExecutionResult) as a [TxRejection],
//! and reverts are a normal result carrying the revert reason.

use thiserror::Error;

use crate::common::{Wei, U256};

/// Hard failures of node operations.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The operation requires `start` to have completed.
    #[error("node not initialized")]
    NotInitialized,

    /// `start` was called on a running node.
    #[error("node already started")]
    AlreadyStarted,

    /// The snapshot id is unknown or was invalidated by an older revert.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(u64),

    /// The filter id is unknown or was uninstalled.
    #[error("filter {0} not found")]
    FilterNotFound(String),

    /// The pending block cannot take the transaction.
    #[error("block full: {reason}")]
    BlockFull { reason: &'static str },

    /// The cancellation signal fired before any state was touched.
    #[error("operation cancelled")]
    Cancelled,

    /// A signed transaction envelope could not be decoded.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(#[from] crate::tx::TxError),

    /// Malformed record bytes.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The attached key/value backend failed.
    #[error("storage backend: {0}")]
    Storage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reasons a transaction is turned away before it touches any state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TxRejection {
    #[error("nonce too low: expected {expected}, got {got}")]
    NonceTooLow { expected: u64, got: u64 },

    #[error("nonce too high: expected {expected}, got {got}")]
    NonceTooHigh { expected: u64, got: u64 },

    /// Balance does not cover `value + gas_limit * fee_cap`.
    #[error("insufficient funds: have {have}, want {want}")]
    InsufficientFunds { have: Wei, want: U256 },

    #[error("intrinsic gas too low: need {need}, limit {limit}")]
    IntrinsicGasTooLow { need: u64, limit: u64 },

    /// Signed for a different chain.
    #[error("invalid chain id: expected {expected}, got {got}")]
    InvalidChainId { expected: u64, got: u64 },
}

/// Decode failures of the binary codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed rlp: {0}")]
    Rlp(#[from] rlp::DecoderError),

    #[error("{0}: expected a scalar, found a list")]
    UnexpectedList(&'static str),

    #[error("{0}: expected a list, found a scalar")]
    UnexpectedScalar(&'static str),

    #[error("{record}: expected {expected} items, found {found}")]
    Arity {
        record: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{field}: expected {expected} bytes, found {found}")]
    Length {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// Integer with leading zero bytes.
    #[error("{0}: non-canonical integer")]
    NonCanonical(&'static str),

    #[error("{0}: integer overflow")]
    Overflow(&'static str),

    #[error("{0}: invalid utf-8")]
    Utf8(&'static str),

    #[error("{field}: unknown variant {tag}")]
    UnknownVariant { field: &'static str, tag: u64 },

    #[error("{0} trailing bytes after the top-level item")]
    TrailingBytes(usize),
}

/// Rejected configurations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// Combinations of `autoMine` and `blockTime` with no agreed semantics.
    #[error(
        "unsupported mining mode: autoMine={auto_mine}, blockTime={block_time}s"
    )]
    UnsupportedMiningMode { auto_mine: bool, block_time: u64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

pub type ChainResult<T> = Result<T, ChainError>;
