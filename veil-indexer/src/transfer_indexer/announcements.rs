// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ERC-5564 announcement ingestion.
//!
//! Announcements are stored raw and unattributed; the scanner task performs
//! the trial derivation against registered users separately, so ingestion
//! stays cheap and a user registered later can still be matched against
//! history.

use ethers::abi::ParamType;
use ethers::providers::JsonRpcClient;
use ethers::types::{Address, Filter, Log, U256};
use veil_indexer_schema::models::StoredAnnouncement;

use crate::error::{IndexerError, IndexerResult};
use crate::transfer_indexer::TransferIndexer;

const ANNOUNCEMENT_EVENT: &str = "Announcement(uint256,address,address,bytes,bytes)";

impl<P: JsonRpcClient + 'static> TransferIndexer<P> {
    pub(super) async fn sync_announcements(
        &self,
        announcer: Address,
        from: u64,
        to: u64,
    ) -> IndexerResult<()> {
        let filter = Filter::new().address(announcer).event(ANNOUNCEMENT_EVENT);
        let logs = self.fetch_logs_chunked(filter, from, to).await?;
        if logs.is_empty() {
            return Ok(());
        }

        let chain_id = self.config.chain_id as i64;
        let mut rows = Vec::new();
        for log in &logs {
            match announcement_row(chain_id, log) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    tracing::warn!(
                        "[{}] Skipping malformed announcement: {e:?}",
                        self.config.chain_id
                    );
                }
            }
        }

        let written = rows.len();
        self.store.insert_announcements(rows).await?;
        self.metrics
            .announcements_received
            .with_label_values(&[&self.config.chain_id.to_string()])
            .inc_by(written as u64);
        Ok(())
    }
}

pub(super) fn announcement_row(chain_id: i64, log: &Log) -> IndexerResult<StoredAnnouncement> {
    if log.topics.len() != 4 {
        return Err(IndexerError::DecodeError(format!(
            "announcement has {} topics, expected 4",
            log.topics.len()
        )));
    }
    let block_number = log
        .block_number
        .ok_or_else(|| IndexerError::DecodeError("announcement without block number".to_string()))?;
    let tx_index = log
        .transaction_index
        .ok_or_else(|| IndexerError::DecodeError("announcement without tx index".to_string()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| IndexerError::DecodeError("announcement without log index".to_string()))?;

    let scheme_id = U256::from_big_endian(log.topics[1].as_bytes());
    if scheme_id > U256::from(i64::MAX) {
        return Err(IndexerError::DecodeError(format!(
            "scheme id {scheme_id} out of range"
        )));
    }

    // Non-indexed payload: (bytes ephemeralPubKey, bytes metadata)
    let tokens = ethers::abi::decode(&[ParamType::Bytes, ParamType::Bytes], &log.data)
        .map_err(|e| IndexerError::DecodeError(format!("bad announcement data: {e}")))?;
    let mut iter = tokens.into_iter();
    let ephemeral_pub_key = iter
        .next()
        .and_then(|t| t.into_bytes())
        .ok_or_else(|| IndexerError::DecodeError("missing ephemeral pub key".to_string()))?;
    let metadata = iter
        .next()
        .and_then(|t| t.into_bytes())
        .ok_or_else(|| IndexerError::DecodeError("missing metadata".to_string()))?;

    Ok(StoredAnnouncement {
        chain_id,
        block_number: block_number.as_u64() as i64,
        tx_index: tx_index.as_u64() as i64,
        log_index: log_index.as_u64() as i64,
        scheme_id: scheme_id.as_u64() as i64,
        stealth_address: log.topics[2].as_bytes()[12..].to_vec(),
        ephemeral_pub_key,
        metadata,
        caller: log.topics[3].as_bytes()[12..].to_vec(),
        attributed: false,
        skipped: false,
    })
}
