// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Thin typed wrapper over an EVM JSON-RPC endpoint.
//!
//! Everything the sync pipeline needs from a chain goes through this client:
//! header lookups, finalized/latest heights, log queries, and call-tracer
//! block traces. Callers wrap these in the retry macro; the client itself
//! performs a single attempt and classifies failures.

use ethers::providers::{Http, JsonRpcClient, Middleware, Provider};
use ethers::types::{
    Block, BlockNumber, Bytes, Filter, Log, Transaction, H256, U256, U64,
};
use prometheus::HistogramTimer;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{IndexerError, IndexerResult};
use crate::metrics::IndexerMetrics;

/// The subset of an EVM block header the tracker persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
}

impl BlockHeader {
    fn try_from_block<T>(block: Block<T>, requested: u64) -> IndexerResult<Self> {
        let (number, hash) = match (block.number, block.hash) {
            (Some(n), Some(h)) => (n.as_u64(), h),
            // Pending blocks carry no number/hash; the pipeline never asks for them.
            _ => return Err(IndexerError::BlockNotFound(requested)),
        };
        Ok(Self {
            number,
            hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp.as_u64(),
        })
    }
}

/// One frame of a `callTracer` trace. `calls` holds the sub-frames in
/// execution order, which is what makes trace addresses well defined.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallFrame {
    #[serde(rename = "type")]
    pub call_type: String,
    pub from: ethers::types::Address,
    pub to: Option<ethers::types::Address>,
    pub value: Option<U256>,
    pub input: Bytes,
    pub error: Option<String>,
    pub calls: Vec<CallFrame>,
}

impl CallFrame {
    /// Whether this frame actually moved native value. Static/delegate calls
    /// and reverted frames never do.
    pub fn moved_value(&self) -> bool {
        self.error.is_none()
            && matches!(self.call_type.as_str(), "CALL" | "CREATE" | "CREATE2")
            && self.value.map_or(false, |v| !v.is_zero())
    }
}

/// Per-transaction result entry of `debug_traceBlockByNumber`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxTraceResult {
    #[serde(rename = "txHash")]
    pub tx_hash: H256,
    pub result: CallFrame,
}

#[derive(Clone)]
pub struct ChainClient<P> {
    provider: Provider<P>,
    chain_id: u64,
    metrics: IndexerMetrics,
}

impl ChainClient<Http> {
    pub fn connect(rpc_url: &str, chain_id: u64, metrics: IndexerMetrics) -> IndexerResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| IndexerError::ConfigError(format!("invalid rpc url: {}", e)))?;
        Ok(Self {
            provider,
            chain_id,
            metrics,
        })
    }
}

impl<P: JsonRpcClient + 'static> ChainClient<P> {
    pub fn new(provider: Provider<P>, chain_id: u64, metrics: IndexerMetrics) -> Self {
        Self {
            provider,
            chain_id,
            metrics,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    // Records the query and returns a latency timer that observes on drop.
    fn observe(&self, query: &str) -> HistogramTimer {
        self.metrics.rpc_queries.with_label_values(&[query]).inc();
        self.metrics
            .rpc_queries_latency
            .with_label_values(&[query])
            .start_timer()
    }

    pub async fn get_block_header(&self, number: u64) -> IndexerResult<BlockHeader> {
        let _timer = self.observe("eth_getBlockByNumber");
        let block = self
            .provider
            .get_block(number)
            .await?
            .ok_or(IndexerError::BlockNotFound(number))?;
        BlockHeader::try_from_block(block, number)
    }

    /// Full block with transaction bodies, used by the tracker to persist
    /// transaction inputs for later tag decoding.
    pub async fn get_block_with_txs(
        &self,
        number: u64,
    ) -> IndexerResult<(BlockHeader, Vec<Transaction>)> {
        let _timer = self.observe("eth_getBlockByNumber_full");
        let block = self
            .provider
            .get_block_with_txs(number)
            .await?
            .ok_or(IndexerError::BlockNotFound(number))?;
        let txs = block.transactions.clone();
        let header = BlockHeader::try_from_block(block, number)?;
        Ok((header, txs))
    }

    pub async fn get_latest_block_number(&self) -> IndexerResult<u64> {
        let _timer = self.observe("eth_blockNumber");
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    /// Height of the last finalized block. Chains without the `finalized`
    /// tag are handled by the caller via a fixed finality distance.
    pub async fn get_finalized_block_number(&self) -> IndexerResult<Option<u64>> {
        let _timer = self.observe("eth_getBlockByNumber_finalized");
        match self.provider.get_block(BlockNumber::Finalized).await {
            Ok(Some(block)) => Ok(block.number.map(|n| n.as_u64())),
            Ok(None) => Ok(None),
            Err(e) => {
                let err = IndexerError::from(e);
                // "unknown block tag" style rejections mean the chain does not
                // serve finalized; transient errors still propagate.
                if err.is_transient() {
                    Err(err)
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub async fn get_logs(&self, filter: &Filter) -> IndexerResult<Vec<Log>> {
        let _timer = self.observe("eth_getLogs");
        Ok(self.provider.get_logs(filter).await?)
    }

    /// Runs `callTracer` over every transaction in a block.
    pub async fn trace_block(&self, number: u64) -> IndexerResult<Vec<TxTraceResult>> {
        let _timer = self.observe("debug_traceBlockByNumber");
        let results: Vec<TxTraceResult> = self
            .provider
            .request(
                "debug_traceBlockByNumber",
                json!([U64::from(number), { "tracer": "callTracer" }]),
            )
            .await?;
        Ok(results)
    }
}

/// Flattens a call-frame tree into `(trace_address, frame)` pairs in
/// depth-first execution order. The root frame has the empty address.
pub fn flatten_call_frames(root: &CallFrame) -> Vec<(Vec<usize>, &CallFrame)> {
    let mut out = Vec::new();
    let mut stack = vec![(Vec::new(), root)];
    while let Some((addr, frame)) = stack.pop() {
        out.push((addr.clone(), frame));
        for (i, child) in frame.calls.iter().enumerate().rev() {
            let mut child_addr = addr.clone();
            child_addr.push(i);
            stack.push((child_addr, child));
        }
    }
    out
}

/// Renders a trace address as the dotted path stored in the traces table,
/// e.g. `[0, 2, 1]` -> `"0.2.1"` and `[]` -> `""`.
pub fn trace_address_string(addr: &[usize]) -> String {
    addr.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::MockProvider;
    use ethers::types::Address;

    fn mocked_client() -> (ChainClient<MockProvider>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        (
            ChainClient::new(provider, 1, IndexerMetrics::new_for_testing()),
            mock,
        )
    }

    fn block_json(number: u64, hash: &str, parent: &str, timestamp: u64) -> serde_json::Value {
        json!({
            "number": format!("{:#x}", number),
            "hash": hash,
            "parentHash": parent,
            "timestamp": format!("{:#x}", timestamp),
            "sha3Uncles": "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
            "miner": "0x0000000000000000000000000000000000000000",
            "stateRoot": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "transactionsRoot": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "receiptsRoot": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "logsBloom": format!("0x{}", "00".repeat(256)),
            "difficulty": "0x0",
            "totalDifficulty": "0x0",
            "extraData": "0x",
            "size": "0x0",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x0",
            "transactions": [],
            "uncles": [],
        })
    }

    #[tokio::test]
    async fn test_get_block_header() {
        let (client, mock) = mocked_client();
        let hash = "0x11953d5c2bc5e2e49f3b42cbb10e65b72e4b4a964ff4a8a44a8f5007d22bfa4b";
        let parent = "0x88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6";
        mock.push_response(ethers::providers::MockResponse::Value(block_json(
            100, hash, parent, 1_700_000_000,
        )));

        let header = client.get_block_header(100).await.unwrap();
        assert_eq!(header.number, 100);
        assert_eq!(header.hash, hash.parse::<H256>().unwrap());
        assert_eq!(header.parent_hash, parent.parse::<H256>().unwrap());
        assert_eq!(header.timestamp, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_missing_block_is_block_not_found() {
        let (client, mock) = mocked_client();
        mock.push_response(ethers::providers::MockResponse::Value(
            serde_json::Value::Null,
        ));
        let err = client.get_block_header(42).await.unwrap_err();
        assert_eq!(err, IndexerError::BlockNotFound(42));
    }

    #[test]
    fn test_flatten_call_frames_depth_first() {
        let leaf = CallFrame {
            call_type: "CALL".to_string(),
            ..Default::default()
        };
        let root = CallFrame {
            call_type: "CALL".to_string(),
            calls: vec![
                CallFrame {
                    call_type: "CALL".to_string(),
                    calls: vec![leaf.clone()],
                    ..Default::default()
                },
                leaf,
            ],
            ..Default::default()
        };

        let flat = flatten_call_frames(&root);
        let addrs: Vec<String> = flat
            .iter()
            .map(|(a, _)| trace_address_string(a))
            .collect();
        assert_eq!(addrs, vec!["", "0", "0.0", "1"]);
    }

    #[test]
    fn test_moved_value_excludes_static_and_reverted_calls() {
        let mut frame = CallFrame {
            call_type: "CALL".to_string(),
            value: Some(U256::from(7)),
            ..Default::default()
        };
        assert!(frame.moved_value());

        frame.call_type = "STATICCALL".to_string();
        assert!(!frame.moved_value());

        frame.call_type = "CALL".to_string();
        frame.error = Some("execution reverted".to_string());
        assert!(!frame.moved_value());

        frame.error = None;
        frame.value = Some(U256::zero());
        assert!(!frame.moved_value());
    }

    #[test]
    fn test_call_frame_deserializes_call_tracer_output() {
        let raw = json!({
            "type": "CALL",
            "from": "0x000000000000000000000000000000000000dead",
            "to": "0x000000000000000000000000000000000000beef",
            "value": "0xde0b6b3a7640000",
            "input": "0x",
            "calls": [
                { "type": "STATICCALL",
                  "from": "0x000000000000000000000000000000000000beef",
                  "to": "0x000000000000000000000000000000000000cafe",
                  "input": "0x01" }
            ]
        });
        let frame: CallFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(frame.call_type, "CALL");
        assert_eq!(
            frame.to,
            Some("0x000000000000000000000000000000000000beef".parse::<Address>().unwrap())
        );
        assert_eq!(frame.calls.len(), 1);
        assert_eq!(frame.calls[0].call_type, "STATICCALL");
        assert!(frame.calls[0].value.is_none());
    }
}
