// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ERC-20 transfers involving tracked stealth addresses.
//!
//! Transfer logs are topic-filtered server side: one query batch per
//! direction (sender topic, recipient topic) over at most
//! `address_batch_size` addresses, so the provider does the matching
//! instead of the indexer streaming every token transfer.

use std::collections::HashSet;

use ethers::providers::JsonRpcClient;
use ethers::types::{Address, Filter, Log, ValueOrArray, H256, U256};

use crate::error::{IndexerError, IndexerResult};
use crate::transfer_indexer::{effect_rows, TransferEffect, TransferIndexer};

const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";

impl<P: JsonRpcClient + 'static> TransferIndexer<P> {
    pub(super) async fn sync_token(
        &self,
        token_id: &str,
        token: Address,
        from: u64,
        to: u64,
        stealth: &HashSet<Address>,
    ) -> IndexerResult<()> {
        if stealth.is_empty() {
            return Ok(());
        }
        let mut tracked: Vec<H256> = stealth.iter().map(|a| H256::from(*a)).collect();
        tracked.sort();

        let mut logs: Vec<Log> = Vec::new();
        for batch in tracked.chunks(self.config.address_batch_size) {
            let sent = Filter::new()
                .address(token)
                .event(TRANSFER_EVENT)
                .topic1(ValueOrArray::Array(batch.to_vec()));
            let received = Filter::new()
                .address(token)
                .event(TRANSFER_EVENT)
                .topic2(ValueOrArray::Array(batch.to_vec()));
            logs.extend(self.fetch_logs_chunked(sent, from, to).await?);
            logs.extend(self.fetch_logs_chunked(received, from, to).await?);
        }

        let mut effects = Vec::new();
        for log in &logs {
            match token_transfer_effect(token_id, log) {
                Ok(effect) => effects.push(effect),
                Err(e) => {
                    // Malformed rows are dropped, not retried.
                    tracing::warn!(
                        "[{}] Skipping malformed transfer log for {token_id}: {e:?}",
                        self.config.chain_id
                    );
                }
            }
        }
        if effects.is_empty() {
            return Ok(());
        }
        // A self-transfer matches both direction queries; the (tx, log_index)
        // key dedupes it at insert time.
        let written = effects.len();
        let (mut rows, _) = effect_rows(self.config.chain_id as i64, effects, stealth);
        let price = self.prices.token_price(token_id);
        for row in &mut rows {
            row.token_price_at_trace = price;
        }
        self.store.insert_traces(rows).await?;
        self.metrics
            .transfers_indexed
            .with_label_values(&[&self.config.chain_id.to_string(), "token"])
            .inc_by(written as u64);
        Ok(())
    }
}

pub(super) fn token_transfer_effect(token_id: &str, log: &Log) -> IndexerResult<TransferEffect> {
    if log.topics.len() != 3 {
        return Err(IndexerError::DecodeError(format!(
            "transfer log has {} topics, expected 3",
            log.topics.len()
        )));
    }
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| IndexerError::DecodeError("transfer log without tx hash".to_string()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| IndexerError::DecodeError("transfer log without log index".to_string()))?;
    if log.data.len() != 32 {
        return Err(IndexerError::DecodeError(format!(
            "transfer log data is {} bytes, expected 32",
            log.data.len()
        )));
    }
    Ok(TransferEffect::Token {
        tx_hash,
        log_index: log_index.as_u64(),
        token_id: token_id.to_string(),
        from: Address::from_slice(&log.topics[1].as_bytes()[12..]),
        to: Address::from_slice(&log.topics[2].as_bytes()[12..]),
        amount: U256::from_big_endian(&log.data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};

    fn transfer_log(from: Address, to: Address, amount: u64) -> Log {
        let mut data = [0u8; 32];
        U256::from(amount).to_big_endian(&mut data);
        Log {
            address: Address::repeat_byte(0x10),
            topics: vec![
                ethers::utils::keccak256(TRANSFER_EVENT.as_bytes()).into(),
                H256::from(from),
                H256::from(to),
            ],
            data: Bytes::from(data.to_vec()),
            transaction_hash: Some(H256::repeat_byte(0x42)),
            log_index: Some(U256::from(3)),
            block_number: Some(U64::from(100)),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_transfer_log() {
        let from = Address::repeat_byte(0xaa);
        let to = Address::repeat_byte(0xbb);
        let effect = token_transfer_effect("usdc", &transfer_log(from, to, 1_500)).unwrap();
        assert_eq!(
            effect,
            TransferEffect::Token {
                tx_hash: H256::repeat_byte(0x42),
                log_index: 3,
                token_id: "usdc".to_string(),
                from,
                to,
                amount: U256::from(1_500u64),
            }
        );
    }

    #[test]
    fn test_anonymous_style_log_is_rejected() {
        let mut log = transfer_log(Address::repeat_byte(0xaa), Address::repeat_byte(0xbb), 1);
        log.topics.truncate(1);
        let err = token_transfer_effect("usdc", &log).unwrap_err();
        assert_eq!(err.error_type(), "decode_error");
    }

    #[test]
    fn test_pending_log_is_rejected() {
        let mut log = transfer_log(Address::repeat_byte(0xaa), Address::repeat_byte(0xbb), 1);
        log.log_index = None;
        let err = token_transfer_effect("usdc", &log).unwrap_err();
        assert_eq!(err.error_type(), "decode_error");
    }
}
