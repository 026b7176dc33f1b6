// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::providers::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    // The requested block does not exist (yet) on the chain
    BlockNotFound(u64),
    // The referenced transaction does not exist
    TxNotFound,
    // Transient provider error (timeout, rate limit); retryable with the same parameters
    TransientProviderError(String),
    // The requested log range exceeds the provider limit; caller must shrink the chunk
    RangeTooLarge(String),
    // Non-transient provider error
    ProviderError(String),
    // A record could not be decoded (malformed tag, metadata, or call data);
    // the record is skipped, never retried indefinitely
    DecodeError(String),
    // Stored state disagrees with the chain (hash mismatch mid-repair, missing
    // parent); triggers the reorg-repair path rather than being fatal
    DataInconsistency(String),
    // A bug: duplicate canonical block, group observed-count exceeding its size.
    // Logged at error severity; the affected range is reprocessed from the last
    // known-good cursor
    InvariantViolation(String),
    // Storage error
    StorageError(String),
    // Invalid configuration
    ConfigError(String),
    // Uncategorized error
    Generic(String),
}

impl IndexerError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            IndexerError::BlockNotFound(_) => "block_not_found",
            IndexerError::TxNotFound => "tx_not_found",
            IndexerError::TransientProviderError(_) => "transient_provider_error",
            IndexerError::RangeTooLarge(_) => "range_too_large",
            IndexerError::ProviderError(_) => "provider_error",
            IndexerError::DecodeError(_) => "decode_error",
            IndexerError::DataInconsistency(_) => "data_inconsistency",
            IndexerError::InvariantViolation(_) => "invariant_violation",
            IndexerError::StorageError(_) => "storage_error",
            IndexerError::ConfigError(_) => "config_error",
            IndexerError::Generic(_) => "generic",
        }
    }

    /// Whether retrying with the same parameters can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::TransientProviderError(_) | IndexerError::RangeTooLarge(_)
        )
    }
}

impl std::fmt::Display for IndexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexerError::BlockNotFound(number) => write!(f, "block {number} not found"),
            IndexerError::TxNotFound => write!(f, "transaction not found"),
            IndexerError::TransientProviderError(msg) => {
                write!(f, "transient provider error: {msg}")
            }
            IndexerError::RangeTooLarge(msg) => write!(f, "log range too large: {msg}"),
            IndexerError::ProviderError(msg) => write!(f, "provider error: {msg}"),
            IndexerError::DecodeError(msg) => write!(f, "decode error: {msg}"),
            IndexerError::DataInconsistency(msg) => write!(f, "data inconsistency: {msg}"),
            IndexerError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            IndexerError::StorageError(msg) => write!(f, "storage error: {msg}"),
            IndexerError::ConfigError(msg) => write!(f, "invalid configuration: {msg}"),
            IndexerError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for IndexerError {}

impl From<ProviderError> for IndexerError {
    fn from(err: ProviderError) -> Self {
        match &err {
            ProviderError::JsonRpcClientError(e) => {
                let msg = e.to_string();
                // Providers phrase their range limit differently; match the common ones.
                if msg.contains("block range") || msg.contains("query returned more than") {
                    IndexerError::RangeTooLarge(msg)
                } else {
                    IndexerError::TransientProviderError(msg)
                }
            }
            ProviderError::EnsError(_) | ProviderError::EnsNotOwned(_) => {
                IndexerError::ProviderError(err.to_string())
            }
            _ => IndexerError::TransientProviderError(err.to_string()),
        }
    }
}

impl From<diesel::result::Error> for IndexerError {
    fn from(err: diesel::result::Error) -> Self {
        IndexerError::StorageError(err.to_string())
    }
}

impl From<anyhow::Error> for IndexerError {
    fn from(err: anyhow::Error) -> Self {
        IndexerError::Generic(err.to_string())
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
