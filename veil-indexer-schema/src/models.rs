// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Row models for the wallet indexer tables.
//!
//! Reorg-mutable rows (blocks, transactions, traces, user operations) can be
//! deleted and recreated by the canonical chain tracker; everything else is
//! append-only once written.

use diesel::prelude::*;

use crate::schema::{
    blocks, erc5564_announcements, sync_cursors, traces, transactions, user_actions,
    user_operations, user_stealth_addresses, users,
};

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = blocks)]
pub struct StoredBlock {
    pub chain_id: i64,
    pub number: i64,
    pub hash: Vec<u8>,
    pub parent_hash: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = transactions)]
pub struct StoredTransaction {
    pub hash: Vec<u8>,
    pub chain_id: i64,
    pub block_hash: Vec<u8>,
    pub block_number: i64,
    pub input: Option<Vec<u8>>,
    pub user_action_id: Option<i64>,
}

/// A normalized transfer effect. Exactly one of `trace_address` (internal
/// call path) and `log_index` (event position) is set; together with the
/// transaction hash it forms the natural key used for deduplication.
#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = traces)]
pub struct NewTrace {
    pub chain_id: i64,
    pub transaction_hash: Vec<u8>,
    pub trace_address: Option<String>,
    pub log_index: Option<i64>,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub amount: String,
    pub token_id: Option<String>,
    pub token_price_at_trace: Option<f64>,
    pub transfer_group_id: Option<String>,
    pub from_stealth_address: Option<Vec<u8>>,
    pub to_stealth_address: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Queryable)]
#[diesel(table_name = traces)]
pub struct StoredTrace {
    pub id: i64,
    pub chain_id: i64,
    pub transaction_hash: Vec<u8>,
    pub trace_address: Option<String>,
    pub log_index: Option<i64>,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub amount: String,
    pub token_id: Option<String>,
    pub token_price_at_trace: Option<f64>,
    pub transfer_group_id: Option<String>,
    pub from_stealth_address: Option<Vec<u8>>,
    pub to_stealth_address: Option<Vec<u8>>,
}

/// One settled account-abstraction operation. `call_kind` records what the
/// op's `execute` calldata decoded to ("token_transfer", "native_transfer",
/// or "opaque"); the value movement itself is indexed by the trace and log
/// sources.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = user_operations)]
pub struct StoredUserOperation {
    pub op_hash: Vec<u8>,
    pub chain_id: i64,
    pub transaction_hash: Vec<u8>,
    pub sender: Vec<u8>,
    pub block_number: i64,
    pub call_kind: String,
    pub call_target: Option<Vec<u8>>,
    pub call_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = user_stealth_addresses)]
pub struct StoredUserStealthAddress {
    pub address: Vec<u8>,
    pub user_id: i64,
    pub signer_address: Vec<u8>,
    pub ephemeral_pub_key: Vec<u8>,
    pub view_tag: i16,
    pub label: Option<String>,
}

/// `attributed` is set once a user claims the announcement; `skipped` marks
/// rows the scanner can never match (unsupported scheme, malformed payload)
/// so they leave the scan set permanently.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = erc5564_announcements)]
pub struct StoredAnnouncement {
    pub chain_id: i64,
    pub block_number: i64,
    pub tx_index: i64,
    pub log_index: i64,
    pub scheme_id: i64,
    pub stealth_address: Vec<u8>,
    pub ephemeral_pub_key: Vec<u8>,
    pub metadata: Vec<u8>,
    pub caller: Vec<u8>,
    pub attributed: bool,
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Insertable)]
#[diesel(table_name = user_actions)]
pub struct NewUserAction {
    pub group_tag: Vec<u8>,
    pub group_size: i32,
    pub tx_hashes: Vec<Vec<u8>>,
    pub action_type: i16,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable)]
#[diesel(table_name = user_actions)]
pub struct StoredUserAction {
    pub id: i64,
    pub group_tag: Vec<u8>,
    pub group_size: i32,
    pub tx_hashes: Vec<Vec<u8>>,
    pub action_type: i16,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = sync_cursors)]
pub struct StoredSyncCursor {
    pub chain_id: i64,
    pub category: String,
    pub key: String,
    pub block_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = users)]
pub struct StoredUser {
    pub id: i64,
    pub spending_pub_key: Vec<u8>,
    pub viewing_priv_key: Vec<u8>,
}
