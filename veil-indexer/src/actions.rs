// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! User-action aggregation.
//!
//! A wallet action (a swap, a multi-chain send) can fan out into several
//! transactions on several chains. The wallet appends a tag to the calldata
//! of every leg it signs: a 4-byte magic, a random 16-byte group tag, the
//! declared group size, and the action type. The aggregator groups indexed
//! transactions by tag and publishes a user action once every declared leg
//! has landed. Transactions without a decodable tag become size-1 groups of
//! the opaque action type.
//!
//! A group's timestamp is the maximum of its legs' block timestamps. A leg
//! whose block timestamp is unknown (or zero, which some chains emit for
//! genesis) keeps the whole group pending rather than publishing a bogus
//! timestamp.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use veil_indexer_schema::models::{NewUserAction, StoredTransaction};

use crate::config::AggregatorConfig;
use crate::error::IndexerResult;
use crate::metrics::IndexerMetrics;
use crate::store::Store;

/// Trailing calldata marker: "VACT".
pub const ACTION_TAG_MAGIC: [u8; 4] = [0x56, 0x41, 0x43, 0x54];
/// magic + group tag + group size + action type
pub const ACTION_TAG_LEN: usize = 4 + 16 + 1 + 1;

/// Action type recorded for transactions without a decodable tag.
pub const ACTION_TYPE_OPAQUE: u8 = 0;

const CANDIDATE_BATCH: i64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTag {
    pub group_tag: [u8; 16],
    pub group_size: u8,
    pub action_type: u8,
}

/// Decodes the trailing action tag from transaction calldata. Anything that
/// does not end in a well-formed tag is simply untagged.
pub fn decode_action_tag(input: &[u8]) -> Option<ActionTag> {
    if input.len() < ACTION_TAG_LEN {
        return None;
    }
    let tail = &input[input.len() - ACTION_TAG_LEN..];
    if tail[..4] != ACTION_TAG_MAGIC {
        return None;
    }
    let mut group_tag = [0u8; 16];
    group_tag.copy_from_slice(&tail[4..20]);
    let group_size = tail[20];
    if group_size == 0 {
        return None;
    }
    Some(ActionTag {
        group_tag,
        group_size: tail[20],
        action_type: tail[21],
    })
}

/// Appends a tag to calldata; the signing side of the wire format.
pub fn encode_action_tag(input: &mut Vec<u8>, tag: &ActionTag) {
    input.extend_from_slice(&ACTION_TAG_MAGIC);
    input.extend_from_slice(&tag.group_tag);
    input.push(tag.group_size);
    input.push(tag.action_type);
}

#[derive(Debug)]
struct PendingGroup {
    group_tag: Vec<u8>,
    group_size: u8,
    action_type: u8,
    // (hash, chain_id, block_number) per observed leg
    members: Vec<(Vec<u8>, i64, i64)>,
}

impl PendingGroup {
    fn is_complete(&self) -> bool {
        self.members.len() == self.group_size as usize
    }

    fn is_overfull(&self) -> bool {
        self.members.len() > self.group_size as usize
    }
}

/// Groups candidate transactions by action tag. Tag collisions with
/// conflicting size or type are dropped with a warning; they cannot be
/// grouped soundly.
fn group_candidates(txs: &[StoredTransaction], metrics: &IndexerMetrics) -> Vec<PendingGroup> {
    let mut tagged: HashMap<[u8; 16], PendingGroup> = HashMap::new();
    let mut untagged = Vec::new();

    for tx in txs {
        let tag = tx.input.as_deref().and_then(decode_action_tag);
        let member = (tx.hash.clone(), tx.chain_id, tx.block_number);
        match tag {
            Some(tag) => {
                let group = tagged.entry(tag.group_tag).or_insert_with(|| PendingGroup {
                    group_tag: tag.group_tag.to_vec(),
                    group_size: tag.group_size,
                    action_type: tag.action_type,
                    members: Vec::new(),
                });
                if group.group_size != tag.group_size || group.action_type != tag.action_type {
                    warn!(
                        "Conflicting action tag {} across legs, dropping group",
                        hex::encode(tag.group_tag)
                    );
                    group.group_size = 0;
                    continue;
                }
                group.members.push(member);
            }
            None => {
                metrics.unrecognized_action_tags.inc();
                untagged.push(PendingGroup {
                    // The tx hash doubles as a collision-free tag.
                    group_tag: tx.hash[..16.min(tx.hash.len())].to_vec(),
                    group_size: 1,
                    action_type: ACTION_TYPE_OPAQUE,
                    members: vec![member],
                });
            }
        }
    }

    tagged
        .into_values()
        .filter(|g| g.group_size > 0)
        .chain(untagged)
        .collect()
}

pub struct UserActionAggregator {
    store: Store,
    config: AggregatorConfig,
    metrics: IndexerMetrics,
}

impl UserActionAggregator {
    pub fn new(store: Store, config: AggregatorConfig, metrics: IndexerMetrics) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> IndexerResult<()> {
        info!("Starting user action aggregator");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("User action aggregator shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
            if let Err(e) = self.aggregate_pass().await {
                warn!("Aggregation pass failed: {e:?}");
                self.metrics
                    .indexer_errors
                    .with_label_values(&["aggregator", e.error_type()])
                    .inc();
            }
        }
    }

    async fn aggregate_pass(&self) -> IndexerResult<()> {
        let candidates = self.store.unassigned_transactions(CANDIDATE_BATCH).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        for group in group_candidates(&candidates, &self.metrics) {
            if group.is_overfull() {
                error!(
                    "Group {} has {} legs but declares {}",
                    hex::encode(&group.group_tag),
                    group.members.len(),
                    group.group_size
                );
                self.metrics
                    .indexer_errors
                    .with_label_values(&["aggregator", "invariant_violation"])
                    .inc();
                continue;
            }
            if !group.is_complete() {
                continue;
            }

            let Some(timestamp) = self.group_timestamp(&group).await? else {
                // A leg without a trustworthy block timestamp keeps the
                // group pending; it completes once the block is stored.
                continue;
            };

            let mut tx_hashes: Vec<Vec<u8>> =
                group.members.iter().map(|(hash, _, _)| hash.clone()).collect();
            tx_hashes.sort();

            let created = self
                .store
                .record_user_action(NewUserAction {
                    group_tag: group.group_tag.clone(),
                    group_size: group.group_size as i32,
                    tx_hashes,
                    action_type: group.action_type as i16,
                    timestamp,
                })
                .await?;
            if created.is_some() {
                self.metrics.user_actions_created.inc();
                if group.group_size > 1 {
                    self.metrics.user_actions_completed.inc();
                }
            }
        }
        Ok(())
    }

    /// The action timestamp is the latest of its legs' block timestamps.
    /// Returns `None` when any leg's block is missing or carries a zero
    /// timestamp.
    async fn group_timestamp(&self, group: &PendingGroup) -> IndexerResult<Option<i64>> {
        let mut by_chain: HashMap<i64, Vec<i64>> = HashMap::new();
        for (_, chain_id, block_number) in &group.members {
            by_chain.entry(*chain_id).or_default().push(*block_number);
        }

        let mut latest = 0i64;
        for (chain_id, numbers) in by_chain {
            let blocks = self.store.blocks_in_range(chain_id, &numbers).await?;
            let found: HashMap<i64, i64> =
                blocks.iter().map(|b| (b.number, b.timestamp)).collect();
            for number in numbers {
                match found.get(&number) {
                    Some(&ts) if ts > 0 => latest = latest.max(ts),
                    _ => return Ok(None),
                }
            }
        }
        Ok(Some(latest))
    }
}
