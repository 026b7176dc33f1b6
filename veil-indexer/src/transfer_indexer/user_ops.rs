// Copyright (c) Veil, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ERC-4337 user operations sent from tracked stealth addresses.
//!
//! The entry point emits one `UserOperationEvent` per executed op with the
//! op hash and sender indexed. The op's `execute` calldata is recovered
//! from the bundler transaction's `handleOps` input and classified into
//! [`UserOpCall`]; the value movement itself is indexed by the trace and
//! log sources, so the classification is stored on the op row instead of
//! producing a second transfer row.

use std::collections::HashSet;

use ethers::abi::ParamType;
use ethers::providers::JsonRpcClient;
use ethers::types::{Address, Filter, Log, ValueOrArray, H256, U256};

use crate::error::{IndexerError, IndexerResult};
use crate::transfer_indexer::{effect_rows, TransferEffect, TransferIndexer, UserOpCall};

const USER_OPERATION_EVENT: &str =
    "UserOperationEvent(bytes32,address,address,uint256,bool,uint256,uint256)";

// handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)[],address)
const HANDLE_OPS_SELECTOR: [u8; 4] = [0x1f, 0xad, 0x94, 0x8c];
// execute(address,uint256,bytes)
const EXECUTE_SELECTOR: [u8; 4] = [0xb6, 0x1d, 0x27, 0xf6];
// transfer(address,uint256)
const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

impl<P: JsonRpcClient + 'static> TransferIndexer<P> {
    pub(super) async fn sync_user_ops(
        &self,
        entry_point: Address,
        from: u64,
        to: u64,
        stealth: &HashSet<Address>,
    ) -> IndexerResult<()> {
        if stealth.is_empty() {
            return Ok(());
        }
        let mut tracked: Vec<H256> = stealth.iter().map(|a| H256::from(*a)).collect();
        tracked.sort();

        let mut effects = Vec::new();
        for batch in tracked.chunks(self.config.address_batch_size) {
            let filter = Filter::new()
                .address(entry_point)
                .event(USER_OPERATION_EVENT)
                .topic2(ValueOrArray::Array(batch.to_vec()));
            for log in self.fetch_logs_chunked(filter, from, to).await? {
                match self.user_op_effect(&log).await {
                    Ok(effect) => effects.push(effect),
                    Err(e) => {
                        tracing::warn!(
                            "[{}] Skipping malformed user operation event: {e:?}",
                            self.config.chain_id
                        );
                    }
                }
            }
        }
        if effects.is_empty() {
            return Ok(());
        }

        let written = effects.len();
        let (_, ops) = effect_rows(self.config.chain_id as i64, effects, stealth);
        self.store.insert_user_operations(ops).await?;
        self.metrics
            .transfers_indexed
            .with_label_values(&[&self.config.chain_id.to_string(), "user_op"])
            .inc_by(written as u64);
        Ok(())
    }

    async fn user_op_effect(&self, log: &Log) -> IndexerResult<TransferEffect> {
        let (op_hash, tx_hash, sender, block_number) = user_op_event_fields(log)?;

        // The bundler tx is already stored by the tracker; ops outside the
        // canonical record stay opaque.
        let call = match self
            .store
            .transaction(tx_hash.as_bytes())
            .await?
            .and_then(|tx| tx.input)
        {
            Some(input) => user_op_calldata(&input, sender)
                .map(|calldata| classify_execute(&calldata))
                .unwrap_or(UserOpCall::OpaqueCall),
            None => UserOpCall::OpaqueCall,
        };

        Ok(TransferEffect::Opaque {
            op_hash,
            tx_hash,
            sender,
            block_number,
            call,
        })
    }
}

fn user_op_event_fields(log: &Log) -> IndexerResult<(H256, H256, Address, u64)> {
    if log.topics.len() < 3 {
        return Err(IndexerError::DecodeError(format!(
            "user operation event has {} topics, expected at least 3",
            log.topics.len()
        )));
    }
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| IndexerError::DecodeError("user op event without tx hash".to_string()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| IndexerError::DecodeError("user op event without block number".to_string()))?;
    Ok((
        log.topics[1],
        tx_hash,
        Address::from_slice(&log.topics[2].as_bytes()[12..]),
        block_number.as_u64(),
    ))
}

/// Extracts `sender`'s op calldata from a `handleOps` bundler transaction.
pub(super) fn user_op_calldata(tx_input: &[u8], sender: Address) -> Option<Vec<u8>> {
    if tx_input.len() < 4 || tx_input[..4] != HANDLE_OPS_SELECTOR {
        return None;
    }
    let tokens = ethers::abi::decode(
        &[
            ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,   // sender
                ParamType::Uint(256), // nonce
                ParamType::Bytes,     // initCode
                ParamType::Bytes,     // callData
                ParamType::Uint(256), // callGasLimit
                ParamType::Uint(256), // verificationGasLimit
                ParamType::Uint(256), // preVerificationGas
                ParamType::Uint(256), // maxFeePerGas
                ParamType::Uint(256), // maxPriorityFeePerGas
                ParamType::Bytes,     // paymasterAndData
                ParamType::Bytes,     // signature
            ]))),
            ParamType::Address, // beneficiary
        ],
        &tx_input[4..],
    )
    .ok()?;

    let ops = tokens.into_iter().next()?.into_array()?;
    for op in ops {
        let mut fields = op.into_tuple()?.into_iter();
        let op_sender = fields.next()?.into_address()?;
        if Address::from(op_sender) != sender {
            continue;
        }
        // skip nonce and initCode
        fields.next()?;
        fields.next()?;
        return fields.next()?.into_bytes();
    }
    None
}

/// Single decode point for the op's intent: token transfer, native
/// transfer, or anything else.
pub(super) fn classify_execute(call_data: &[u8]) -> UserOpCall {
    if call_data.len() < 4 || call_data[..4] != EXECUTE_SELECTOR {
        return UserOpCall::OpaqueCall;
    }
    let Ok(tokens) = ethers::abi::decode(
        &[ParamType::Address, ParamType::Uint(256), ParamType::Bytes],
        &call_data[4..],
    ) else {
        return UserOpCall::OpaqueCall;
    };
    let mut iter = tokens.into_iter();
    let (Some(dest), Some(value), Some(data)) = (
        iter.next().and_then(|t| t.into_address()),
        iter.next().and_then(|t| t.into_uint()),
        iter.next().and_then(|t| t.into_bytes()),
    ) else {
        return UserOpCall::OpaqueCall;
    };
    let dest = Address::from(dest);

    if data.is_empty() && !value.is_zero() {
        return UserOpCall::NativeTransfer { to: dest, value };
    }
    if data.len() >= 4 && data[..4] == ERC20_TRANSFER_SELECTOR {
        if let Ok(args) =
            ethers::abi::decode(&[ParamType::Address, ParamType::Uint(256)], &data[4..])
        {
            let mut iter = args.into_iter();
            if let (Some(to), Some(amount)) = (
                iter.next().and_then(|t| t.into_address()),
                iter.next().and_then(|t| t.into_uint()),
            ) {
                return UserOpCall::TokenTransfer {
                    token: dest,
                    to: Address::from(to),
                    amount,
                };
            }
        }
    }
    UserOpCall::OpaqueCall
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::Token;

    fn encode_execute(dest: Address, value: U256, data: Vec<u8>) -> Vec<u8> {
        let mut out = EXECUTE_SELECTOR.to_vec();
        out.extend(ethers::abi::encode(&[
            Token::Address(dest),
            Token::Uint(value),
            Token::Bytes(data),
        ]));
        out
    }

    fn encode_handle_ops(ops: Vec<(Address, Vec<u8>)>) -> Vec<u8> {
        let mut out = HANDLE_OPS_SELECTOR.to_vec();
        let op_tokens: Vec<Token> = ops
            .into_iter()
            .map(|(sender, call_data)| {
                Token::Tuple(vec![
                    Token::Address(sender),
                    Token::Uint(U256::zero()),
                    Token::Bytes(vec![]),
                    Token::Bytes(call_data),
                    Token::Uint(U256::zero()),
                    Token::Uint(U256::zero()),
                    Token::Uint(U256::zero()),
                    Token::Uint(U256::zero()),
                    Token::Uint(U256::zero()),
                    Token::Bytes(vec![]),
                    Token::Bytes(vec![]),
                ])
            })
            .collect();
        out.extend(ethers::abi::encode(&[
            Token::Array(op_tokens),
            Token::Address(Address::repeat_byte(0xbe)),
        ]));
        out
    }

    #[test]
    fn test_native_transfer_classification() {
        let dest = Address::repeat_byte(0xdd);
        let call = classify_execute(&encode_execute(dest, U256::from(100u64), vec![]));
        assert_eq!(
            call,
            UserOpCall::NativeTransfer {
                to: dest,
                value: U256::from(100u64)
            }
        );
    }

    #[test]
    fn test_token_transfer_classification() {
        let token = Address::repeat_byte(0x10);
        let to = Address::repeat_byte(0xdd);
        let mut transfer = ERC20_TRANSFER_SELECTOR.to_vec();
        transfer.extend(ethers::abi::encode(&[
            Token::Address(to),
            Token::Uint(U256::from(5_000u64)),
        ]));
        let call = classify_execute(&encode_execute(token, U256::zero(), transfer));
        assert_eq!(
            call,
            UserOpCall::TokenTransfer {
                token,
                to,
                amount: U256::from(5_000u64)
            }
        );
    }

    #[test]
    fn test_unknown_calls_are_opaque() {
        // Not an execute call at all
        assert_eq!(classify_execute(&[0x01, 0x02, 0x03, 0x04]), UserOpCall::OpaqueCall);
        // execute with arbitrary inner calldata
        let call = classify_execute(&encode_execute(
            Address::repeat_byte(0x20),
            U256::zero(),
            vec![0xde, 0xad, 0xbe, 0xef],
        ));
        assert_eq!(call, UserOpCall::OpaqueCall);
    }

    #[test]
    fn test_calldata_recovered_for_matching_sender_only() {
        let alice = Address::repeat_byte(0xaa);
        let bob = Address::repeat_byte(0xbb);
        let alice_call = encode_execute(Address::repeat_byte(0x01), U256::from(1u64), vec![]);
        let bob_call = encode_execute(Address::repeat_byte(0x02), U256::from(2u64), vec![]);
        let input = encode_handle_ops(vec![(alice, alice_call.clone()), (bob, bob_call.clone())]);

        assert_eq!(user_op_calldata(&input, alice), Some(alice_call));
        assert_eq!(user_op_calldata(&input, bob), Some(bob_call));
        assert_eq!(user_op_calldata(&input, Address::repeat_byte(0xcc)), None);
        assert_eq!(user_op_calldata(&[0u8; 2], alice), None);
    }
}
