// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Native value transfers, extracted from `callTracer` block traces.
//!
//! Every frame that moved value and touches a tracked stealth address
//! becomes one trace row, keyed by transaction hash and dotted trace
//! address. Value sent into the tracked contracts themselves (tokens,
//! entry point, announcer) is excluded; those movements surface through
//! the log-based sources instead.

use std::collections::HashSet;

use ethers::providers::JsonRpcClient;
use ethers::types::{Address, H256};
use std::time::Duration;

use crate::chain_client::{flatten_call_frames, trace_address_string, CallFrame};
use crate::error::{IndexerError, IndexerResult};
use crate::retry_with_max_elapsed_time;
use crate::transfer_indexer::{effect_rows, TransferEffect, TransferIndexer};

impl<P: JsonRpcClient + 'static> TransferIndexer<P> {
    pub(super) async fn sync_native(
        &self,
        from: u64,
        to: u64,
        stealth: &HashSet<Address>,
    ) -> IndexerResult<()> {
        let excluded: HashSet<Address> =
            self.config.known_contract_addresses()?.into_iter().collect();
        let chain_label = self.config.chain_id.to_string();

        for number in from..=to {
            let Ok(Ok(traces)) = retry_with_max_elapsed_time!(
                self.client.trace_block(number),
                self.config.max_retry_duration()
            ) else {
                return Err(IndexerError::TransientProviderError(format!(
                    "failed to trace block {number}"
                )));
            };

            let mut effects = Vec::new();
            for tx_trace in &traces {
                effects.extend(native_effects(
                    tx_trace.tx_hash,
                    &tx_trace.result,
                    stealth,
                    &excluded,
                ));
            }
            if effects.is_empty() {
                continue;
            }
            let written = effects.len();
            let (rows, _) = effect_rows(self.config.chain_id as i64, effects, stealth);
            self.store.insert_traces(rows).await?;
            self.metrics
                .transfers_indexed
                .with_label_values(&[&chain_label, "native"])
                .inc_by(written as u64);
        }
        Ok(())
    }
}

/// Walks one transaction's call tree and keeps the value-moving frames that
/// involve a tracked address on either side.
pub(super) fn native_effects(
    tx_hash: H256,
    root: &CallFrame,
    tracked: &HashSet<Address>,
    excluded: &HashSet<Address>,
) -> Vec<TransferEffect> {
    flatten_call_frames(root)
        .into_iter()
        .filter_map(|(addr, frame)| {
            if !frame.moved_value() {
                return None;
            }
            let to = frame.to?;
            if excluded.contains(&to) {
                return None;
            }
            if !tracked.contains(&frame.from) && !tracked.contains(&to) {
                return None;
            }
            Some(TransferEffect::Native {
                tx_hash,
                trace_address: trace_address_string(&addr),
                from: frame.from,
                to,
                amount: frame.value.unwrap_or_default(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn frame(from: Address, to: Address, value: u64, calls: Vec<CallFrame>) -> CallFrame {
        CallFrame {
            call_type: "CALL".to_string(),
            from,
            to: Some(to),
            value: Some(U256::from(value)),
            calls,
            ..Default::default()
        }
    }

    #[test]
    fn test_nested_transfer_to_tracked_address_is_found() {
        let user = Address::repeat_byte(0xaa);
        let other = Address::repeat_byte(0xbb);
        let relay = Address::repeat_byte(0xcc);
        let tracked: HashSet<Address> = [user].into_iter().collect();

        // other -> relay (untracked), relay -> user nested at [1]
        let root = frame(
            other,
            relay,
            10,
            vec![
                frame(relay, other, 1, vec![]),
                frame(relay, user, 5, vec![]),
            ],
        );
        let effects = native_effects(H256::repeat_byte(0x01), &root, &tracked, &HashSet::new());
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            TransferEffect::Native {
                trace_address,
                to,
                amount,
                ..
            } => {
                assert_eq!(trace_address, "1");
                assert_eq!(*to, user);
                assert_eq!(*amount, U256::from(5u64));
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn test_reverted_and_zero_value_frames_are_skipped() {
        let user = Address::repeat_byte(0xaa);
        let tracked: HashSet<Address> = [user].into_iter().collect();

        let mut reverted = frame(Address::repeat_byte(0xbb), user, 5, vec![]);
        reverted.error = Some("execution reverted".to_string());
        let zero = frame(Address::repeat_byte(0xbb), user, 0, vec![]);
        let root = frame(Address::repeat_byte(0xbb), user, 0, vec![reverted, zero]);

        let effects = native_effects(H256::repeat_byte(0x02), &root, &tracked, &HashSet::new());
        assert!(effects.is_empty());
    }

    #[test]
    fn test_value_into_known_contract_is_excluded() {
        let user = Address::repeat_byte(0xaa);
        let entry_point = Address::repeat_byte(0xee);
        let tracked: HashSet<Address> = [user].into_iter().collect();
        let excluded: HashSet<Address> = [entry_point].into_iter().collect();

        let root = frame(user, entry_point, 100, vec![]);
        let effects = native_effects(H256::repeat_byte(0x03), &root, &tracked, &excluded);
        assert!(effects.is_empty());
    }
}
