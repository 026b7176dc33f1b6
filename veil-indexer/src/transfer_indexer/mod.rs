// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transfer indexer.
//!
//! One indexer task per chain, downstream of the chain tracker. Each sync
//! round advances every source (native traces, one cursor per tracked token,
//! account-abstraction ops, stealth announcements) to the same canonical
//! target block. Row writes are idempotent and the cursor moves only after
//! its rows are durable, so a crash between the two replays the range.

pub mod announcements;
pub mod native;
pub mod tokens;
pub mod user_ops;

use std::cmp::min;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::JsonRpcClient;
use ethers::types::{Address, Filter, Log, H256, U256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use veil_indexer_schema::models::{NewTrace, StoredSyncCursor, StoredUserOperation};

use crate::chain_client::ChainClient;
use crate::config::ChainConfig;
use crate::error::{IndexerError, IndexerResult};
use crate::metrics::IndexerMetrics;
use crate::retry_with_max_elapsed_time;
use crate::store::{
    Store, CURSOR_ANNOUNCEMENTS, CURSOR_NATIVE, CURSOR_TOKEN, CURSOR_USER_OPS,
};

/// A normalized value movement extracted from chain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEffect {
    /// Native value moved by a (possibly internal) call.
    Native {
        tx_hash: H256,
        trace_address: String,
        from: Address,
        to: Address,
        amount: U256,
    },
    /// ERC-20 Transfer event.
    Token {
        tx_hash: H256,
        log_index: u64,
        token_id: String,
        from: Address,
        to: Address,
        amount: U256,
    },
    /// Account-abstraction operation, recorded by op hash and sender with
    /// its decoded call classification. The value it moved is indexed by
    /// the trace and log sources, never from the calldata.
    Opaque {
        op_hash: H256,
        tx_hash: H256,
        sender: Address,
        block_number: u64,
        call: UserOpCall,
    },
}

/// What an account-abstraction op's `execute` calldata decodes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOpCall {
    TokenTransfer {
        token: Address,
        to: Address,
        amount: U256,
    },
    NativeTransfer {
        to: Address,
        value: U256,
    },
    OpaqueCall,
}

impl UserOpCall {
    pub fn kind(&self) -> &'static str {
        match self {
            UserOpCall::TokenTransfer { .. } => "token_transfer",
            UserOpCall::NativeTransfer { .. } => "native_transfer",
            UserOpCall::OpaqueCall => "opaque",
        }
    }

    fn target(&self) -> Option<Vec<u8>> {
        match self {
            UserOpCall::TokenTransfer { to, .. } | UserOpCall::NativeTransfer { to, .. } => {
                Some(to.as_bytes().to_vec())
            }
            UserOpCall::OpaqueCall => None,
        }
    }

    fn value(&self) -> Option<String> {
        match self {
            UserOpCall::TokenTransfer { amount, .. } => Some(amount.to_string()),
            UserOpCall::NativeTransfer { value, .. } => Some(value.to_string()),
            UserOpCall::OpaqueCall => None,
        }
    }
}

/// External price feed for the denormalized per-trace token price. The repo
/// ships only the no-op implementation.
pub trait PriceSource: Send + Sync {
    fn token_price(&self, token_id: &str) -> Option<f64>;
}

pub struct NoPriceSource;

impl PriceSource for NoPriceSource {
    fn token_price(&self, _token_id: &str) -> Option<f64> {
        None
    }
}

/// Converts effects into rows, flagging addresses that belong to tracked
/// stealth addresses.
pub fn effect_rows(
    chain_id: i64,
    effects: Vec<TransferEffect>,
    stealth: &HashSet<Address>,
) -> (Vec<NewTrace>, Vec<StoredUserOperation>) {
    let flag = |addr: &Address| stealth.contains(addr).then(|| addr.as_bytes().to_vec());
    let mut traces = Vec::new();
    let mut ops = Vec::new();
    for effect in effects {
        match effect {
            TransferEffect::Native {
                tx_hash,
                trace_address,
                from,
                to,
                amount,
            } => traces.push(NewTrace {
                chain_id,
                transaction_hash: tx_hash.as_bytes().to_vec(),
                trace_address: Some(trace_address),
                log_index: None,
                from_address: from.as_bytes().to_vec(),
                to_address: to.as_bytes().to_vec(),
                amount: amount.to_string(),
                token_id: None,
                token_price_at_trace: None,
                transfer_group_id: None,
                from_stealth_address: flag(&from),
                to_stealth_address: flag(&to),
            }),
            TransferEffect::Token {
                tx_hash,
                log_index,
                token_id,
                from,
                to,
                amount,
            } => traces.push(NewTrace {
                chain_id,
                transaction_hash: tx_hash.as_bytes().to_vec(),
                trace_address: None,
                log_index: Some(log_index as i64),
                from_address: from.as_bytes().to_vec(),
                to_address: to.as_bytes().to_vec(),
                amount: amount.to_string(),
                token_id: Some(token_id),
                token_price_at_trace: None,
                transfer_group_id: None,
                from_stealth_address: flag(&from),
                to_stealth_address: flag(&to),
            }),
            TransferEffect::Opaque {
                op_hash,
                tx_hash,
                sender,
                block_number,
                call,
            } => ops.push(StoredUserOperation {
                op_hash: op_hash.as_bytes().to_vec(),
                chain_id,
                transaction_hash: tx_hash.as_bytes().to_vec(),
                sender: sender.as_bytes().to_vec(),
                block_number: block_number as i64,
                call_kind: call.kind().to_string(),
                call_target: call.target(),
                call_value: call.value(),
            }),
        }
    }
    (traces, ops)
}

enum SyncSource {
    Native,
    Token { token_id: String, address: Address, start_block: u64 },
    UserOps { entry_point: Address },
    Announcements { announcer: Address },
}

impl SyncSource {
    fn cursor(&self) -> (&'static str, String) {
        match self {
            SyncSource::Native => (CURSOR_NATIVE, "native".to_string()),
            SyncSource::Token { token_id, .. } => (CURSOR_TOKEN, token_id.clone()),
            SyncSource::UserOps { .. } => (CURSOR_USER_OPS, "entry_point".to_string()),
            SyncSource::Announcements { .. } => (CURSOR_ANNOUNCEMENTS, "announcer".to_string()),
        }
    }
}

pub struct TransferIndexer<P> {
    client: Arc<ChainClient<P>>,
    store: Store,
    config: ChainConfig,
    metrics: IndexerMetrics,
    prices: Arc<dyn PriceSource>,
}

impl<P: JsonRpcClient + 'static> TransferIndexer<P> {
    pub fn new(
        client: Arc<ChainClient<P>>,
        store: Store,
        config: ChainConfig,
        metrics: IndexerMetrics,
        prices: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            client,
            store,
            config,
            metrics,
            prices,
        }
    }

    pub async fn run(
        self,
        canonical_tip_rx: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> IndexerResult<()> {
        let chain_id = self.config.chain_id;
        let sources = self.sources()?;
        info!("[{chain_id}] Starting transfer indexer with {} sources", sources.len());
        let mut interval = tokio::time::interval(self.config.sync_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{chain_id}] Transfer indexer shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            let tip = *canonical_tip_rx.borrow();
            if tip < self.config.start_block {
                continue;
            }
            let stealth = self.stealth_set().await?;

            for source in &sources {
                // One failing source never stalls the others.
                if let Err(e) = self.sync_source(source, tip, &stealth).await {
                    let (category, key) = source.cursor();
                    warn!("[{chain_id}] Sync of {category}/{key} failed: {e:?}");
                    self.metrics
                        .indexer_errors
                        .with_label_values(&["transfer_indexer", e.error_type()])
                        .inc();
                }
            }
        }
    }

    fn sources(&self) -> IndexerResult<Vec<SyncSource>> {
        let mut sources = vec![SyncSource::Native];
        for (token_id, address) in self.config.token_addresses()? {
            let start_block = self
                .config
                .tokens
                .iter()
                .find(|t| t.token_id == token_id)
                .map(|t| t.start_block)
                .unwrap_or_default();
            sources.push(SyncSource::Token {
                token_id,
                address,
                start_block,
            });
        }
        if let Some(entry_point) = self.config.entry_point()? {
            sources.push(SyncSource::UserOps { entry_point });
        }
        if let Some(announcer) = self.config.announcer()? {
            sources.push(SyncSource::Announcements { announcer });
        }
        Ok(sources)
    }

    async fn stealth_set(&self) -> IndexerResult<HashSet<Address>> {
        Ok(self
            .store
            .stealth_addresses()
            .await?
            .into_iter()
            .filter(|row| row.address.len() == Address::len_bytes())
            .map(|row| Address::from_slice(&row.address))
            .collect())
    }

    async fn sync_source(
        &self,
        source: &SyncSource,
        tip: u64,
        stealth: &HashSet<Address>,
    ) -> IndexerResult<()> {
        let chain_id = self.config.chain_id as i64;
        let (category, key) = source.cursor();
        let source_start = match source {
            SyncSource::Token { start_block, .. } => (*start_block).max(self.config.start_block),
            _ => self.config.start_block,
        };
        let from = match self.store.cursor(chain_id, category, &key).await? {
            Some(c) => c as u64 + 1,
            None => source_start,
        };
        if from > tip {
            return Ok(());
        }

        match source {
            SyncSource::Native => self.sync_native(from, tip, stealth).await?,
            SyncSource::Token { token_id, address, .. } => {
                self.sync_token(token_id, *address, from, tip, stealth).await?
            }
            SyncSource::UserOps { entry_point } => {
                self.sync_user_ops(*entry_point, from, tip, stealth).await?
            }
            SyncSource::Announcements { announcer } => {
                self.sync_announcements(*announcer, from, tip).await?
            }
        }

        let advanced = self
            .store
            .advance_cursor(StoredSyncCursor {
                chain_id,
                category: category.to_string(),
                key: key.clone(),
                block_number: tip as i64,
            })
            .await?;
        if !advanced {
            // The tip block was rolled back while this pass ran; the next
            // pass restarts from the clamped cursor.
            warn!(
                "[{}] Not advancing {category} cursor to non-canonical block {tip}",
                self.config.chain_id
            );
            return Ok(());
        }
        self.metrics
            .cursor_height
            .with_label_values(&[&self.config.chain_id.to_string(), category])
            .set(tip as i64);
        Ok(())
    }

    /// Fetches logs over `[from, to]`, shrinking the chunk size whenever the
    /// provider rejects a range as too large.
    pub(crate) async fn fetch_logs_chunked(
        &self,
        base: Filter,
        from: u64,
        to: u64,
    ) -> IndexerResult<Vec<Log>> {
        let mut logs = Vec::new();
        let mut chunk = self.config.log_chunk_size;
        let mut start = from;
        while start <= to {
            let end = min(start + chunk - 1, to);
            let filter = base.clone().from_block(start).to_block(end);
            let Ok(Ok(page)) = retry_with_max_elapsed_time!(
                self.try_get_logs(&filter),
                self.config.max_retry_duration()
            ) else {
                return Err(IndexerError::TransientProviderError(format!(
                    "failed to fetch logs in [{start}, {end}]"
                )));
            };
            match page {
                Some(mut page) => {
                    logs.append(&mut page);
                    start = end + 1;
                }
                None if chunk > 1 => chunk = chunk / 2,
                None => {
                    return Err(IndexerError::RangeTooLarge(format!(
                        "provider rejected a single-block log query at {start}"
                    )));
                }
            }
        }
        Ok(logs)
    }

    /// Single log query that reports an over-large range as `None` so the
    /// retry wrapper does not burn its budget on it.
    async fn try_get_logs(&self, filter: &Filter) -> IndexerResult<Option<Vec<Log>>> {
        match self.client.get_logs(filter).await {
            Ok(logs) => Ok(Some(logs)),
            Err(IndexerError::RangeTooLarge(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_rows_flags_stealth_addresses() {
        let ours = Address::repeat_byte(0xaa);
        let theirs = Address::repeat_byte(0xbb);
        let stealth: HashSet<Address> = [ours].into_iter().collect();

        let (traces, ops) = effect_rows(
            1,
            vec![TransferEffect::Native {
                tx_hash: H256::repeat_byte(0x01),
                trace_address: "0.1".to_string(),
                from: theirs,
                to: ours,
                amount: U256::from(1_000_000u64),
            }],
            &stealth,
        );
        assert!(ops.is_empty());
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].from_stealth_address, None);
        assert_eq!(traces[0].to_stealth_address, Some(ours.as_bytes().to_vec()));
        assert_eq!(traces[0].amount, "1000000");
        assert_eq!(traces[0].trace_address.as_deref(), Some("0.1"));
        assert_eq!(traces[0].log_index, None);
    }

    #[test]
    fn test_effect_rows_splits_ops_from_traces() {
        let sender = Address::repeat_byte(0xcc);
        let stealth: HashSet<Address> = [sender].into_iter().collect();
        let (traces, ops) = effect_rows(
            8453,
            vec![
                TransferEffect::Token {
                    tx_hash: H256::repeat_byte(0x02),
                    log_index: 7,
                    token_id: "usdc".to_string(),
                    from: sender,
                    to: Address::repeat_byte(0xdd),
                    amount: U256::from(42u64),
                },
                TransferEffect::Opaque {
                    op_hash: H256::repeat_byte(0x03),
                    tx_hash: H256::repeat_byte(0x04),
                    sender,
                    block_number: 99,
                    call: UserOpCall::NativeTransfer {
                        to: Address::repeat_byte(0xee),
                        value: U256::from(9u64),
                    },
                },
            ],
            &stealth,
        );
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].token_id.as_deref(), Some("usdc"));
        assert_eq!(traces[0].log_index, Some(7));
        assert_eq!(traces[0].trace_address, None);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].block_number, 99);
        assert_eq!(ops[0].sender, sender.as_bytes().to_vec());
        assert_eq!(ops[0].call_kind, "native_transfer");
        assert_eq!(ops[0].call_target, Some(Address::repeat_byte(0xee).as_bytes().to_vec()));
        assert_eq!(ops[0].call_value.as_deref(), Some("9"));
    }
}
