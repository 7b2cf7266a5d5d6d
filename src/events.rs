// src/events.rs
//! Finding an executed user operation on chain and carving its logs out of the bundle receipt.

use std::sync::Arc;

use ethers::{
    abi::{AbiDecode, RawLog},
    contract::EthEvent,
    types::{Address, Bytes, Log, Transaction, H256},
};
use tracing::debug;

use crate::contracts::{BeforeExecutionFilter, IEntryPointCalls, UserOperationEventFilter};
use crate::entry_point::EntryPointLike;
use crate::error::BundlerError;
use crate::types::{
    PackedUserOperation, RpcUserOperation, UserOperation, UserOperationByHash,
    UserOperationReceipt,
};
use crate::validation::parse_hash;

/// A user operation recovered from the bundle transaction that executed it.
#[derive(Debug, Clone)]
pub struct LocatedOperation {
    pub user_op: UserOperation,
    pub transaction: Transaction,
}

pub struct OperationLocator<E> {
    entry_point: Arc<E>,
}

impl<E: EntryPointLike> OperationLocator<E> {
    pub fn new(entry_point: Arc<E>) -> Self {
        Self { entry_point }
    }

    /// Resolves `hash` to the operation and its containing transaction. `None` means the entry
    /// point has not emitted an event for the hash (yet).
    pub async fn locate(&self, hash: &str) -> Result<Option<LocatedOperation>, BundlerError> {
        let hash = parse_hash(hash)?;

        let Some(log) = self.entry_point.get_user_operation_event(hash).await? else {
            return Ok(None);
        };
        let event = decode_user_operation_event(&log)?;

        let Some(tx_hash) = log.transaction_hash else {
            return Ok(None);
        };
        let Some(transaction) = self.entry_point.get_transaction(tx_hash).await? else {
            return Ok(None);
        };

        if transaction.to != Some(self.entry_point.address()) {
            return Err(BundlerError::TransactionParse(
                "unable to parse transaction".to_string(),
            ));
        }

        let ops = decode_bundle(&transaction.input)?;
        let packed = ops
            .into_iter()
            .find(|op| op.sender == event.sender && op.nonce == event.nonce)
            .ok_or_else(|| {
                BundlerError::TransactionParse("unable to find userOp in transaction".to_string())
            })?;
        let user_op = UserOperation::try_from(packed)
            .map_err(|e| BundlerError::TransactionParse(e.to_string()))?;

        Ok(Some(LocatedOperation {
            user_op,
            transaction,
        }))
    }

    pub async fn get_user_operation_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<UserOperationByHash>, BundlerError> {
        let Some(located) = self.locate(hash).await? else {
            return Ok(None);
        };

        let tx = &located.transaction;
        let (Some(block_hash), Some(block_number)) = (tx.block_hash, tx.block_number) else {
            debug!("Transaction {:?} is not mined yet", tx.hash);
            return Ok(None);
        };

        Ok(Some(UserOperationByHash {
            user_operation: RpcUserOperation::from(&located.user_op),
            entry_point: self.entry_point.address(),
            transaction_hash: tx.hash,
            block_hash,
            block_number,
        }))
    }

    pub async fn get_user_operation_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<UserOperationReceipt>, BundlerError> {
        let hash = parse_hash(hash)?;

        let Some(log) = self.entry_point.get_user_operation_event(hash).await? else {
            return Ok(None);
        };
        let event = decode_user_operation_event(&log)?;

        let Some(tx_hash) = log.transaction_hash else {
            return Ok(None);
        };
        let Some(receipt) = self.entry_point.get_transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };

        let logs = filter_logs(hash, self.entry_point.address(), &receipt.logs)?;

        Ok(Some(UserOperationReceipt {
            user_op_hash: hash,
            sender: event.sender,
            nonce: event.nonce,
            actual_gas_cost: event.actual_gas_cost,
            actual_gas_used: event.actual_gas_used,
            success: event.success,
            logs,
            receipt,
        }))
    }
}

fn decode_user_operation_event(log: &Log) -> Result<UserOperationEventFilter, BundlerError> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    UserOperationEventFilter::decode_log(&raw).map_err(|e| {
        BundlerError::TransactionParse(format!("unable to decode UserOperationEvent: {e}"))
    })
}

/// Packed operations carried by a `handleOps` or `handleAggregatedOps` call.
fn decode_bundle(input: &Bytes) -> Result<Vec<PackedUserOperation>, BundlerError> {
    let ops = match IEntryPointCalls::decode(input) {
        Ok(IEntryPointCalls::HandleOps(call)) => call.ops,
        Ok(IEntryPointCalls::HandleAggregatedOps(call)) => call
            .ops_per_aggregator
            .into_iter()
            .flat_map(|group| group.user_ops)
            .collect(),
        _ => Vec::new(),
    };

    if ops.is_empty() {
        return Err(BundlerError::TransactionParse(
            "failed to parse transaction".to_string(),
        ));
    }
    Ok(ops)
}

/// Returns the logs emitted while executing the operation `user_op_hash`.
///
/// Within a bundle each operation's logs sit between the previous boundary (the batch start
/// marker or the preceding operation's `UserOperationEvent`) and its own `UserOperationEvent`.
/// Only logs emitted by `entry_point` count as boundaries.
pub fn filter_logs(
    user_op_hash: H256,
    entry_point: Address,
    logs: &[Log],
) -> Result<Vec<Log>, BundlerError> {
    let before_execution = BeforeExecutionFilter::signature();
    let user_operation_event = UserOperationEventFilter::signature();

    let mut start = None;
    let mut end = None;
    for (idx, log) in logs.iter().enumerate() {
        if log.address != entry_point {
            continue;
        }
        match log.topics.first() {
            Some(topic) if *topic == before_execution => start = Some(idx),
            Some(topic) if *topic == user_operation_event => {
                if log.topics.get(1) == Some(&user_op_hash) {
                    end = Some(idx);
                    break;
                }
                start = Some(idx);
            }
            _ => {}
        }
    }

    let end = end.ok_or_else(|| {
        BundlerError::CorruptLogStream("no UserOperationEvent in logs".to_string())
    })?;
    let start = start.map_or(0, |idx| idx + 1);
    Ok(logs[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use ethers::{
        abi::{self, AbiEncode, Token},
        types::{TransactionReceipt, U256, U64},
        utils::keccak256,
    };

    use super::*;
    use crate::contracts::{HandleAggregatedOpsCall, HandleOpsCall, UserOpsPerAggregator};
    use crate::entry_point::MockEntryPointLike;
    use crate::types::tests::given_user_op;

    fn entry_point() -> Address {
        Address::repeat_byte(0xee)
    }

    fn hash(name: &str) -> H256 {
        keccak256(name.as_bytes()).into()
    }

    fn given_log(label: &str) -> Log {
        Log {
            address: Address::repeat_byte(0x01),
            topics: vec![keccak256(b"Transfer(address,address,uint256)").into()],
            data: Bytes::from(label.as_bytes().to_vec()),
            ..Default::default()
        }
    }

    fn given_batch_start() -> Log {
        Log {
            address: entry_point(),
            topics: vec![BeforeExecutionFilter::signature()],
            ..Default::default()
        }
    }

    fn given_completion(op_hash: H256, sender: Address, nonce: U256) -> Log {
        Log {
            address: entry_point(),
            topics: vec![
                UserOperationEventFilter::signature(),
                op_hash,
                H256::from(sender),
                H256::zero(),
            ],
            data: abi::encode(&[
                Token::Uint(nonce),
                Token::Bool(true),
                Token::Uint(U256::from(1_000)),
                Token::Uint(U256::from(100)),
            ])
            .into(),
            transaction_hash: Some(H256::repeat_byte(0x77)),
            ..Default::default()
        }
    }

    fn given_marker(name: &str) -> Log {
        given_completion(hash(name), Address::zero(), U256::zero())
    }

    fn batch() -> Vec<Log> {
        vec![
            given_batch_start(),
            given_log("A1"),
            given_marker("A"),
            given_log("B1"),
            given_log("B2"),
            given_marker("B"),
            given_log("C1"),
            given_marker("C"),
        ]
    }

    fn labels(logs: &[Log]) -> Vec<String> {
        logs.iter()
            .map(|log| String::from_utf8(log.data.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn isolates_middle_operation() {
        let logs = filter_logs(hash("B"), entry_point(), &batch()).unwrap();
        assert_eq!(labels(&logs), vec!["B1", "B2"]);
    }

    #[test]
    fn isolates_first_operation() {
        let logs = filter_logs(hash("A"), entry_point(), &batch()).unwrap();
        assert_eq!(labels(&logs), vec!["A1"]);
    }

    #[test]
    fn isolates_last_operation() {
        let logs = filter_logs(hash("C"), entry_point(), &batch()).unwrap();
        assert_eq!(labels(&logs), vec!["C1"]);
    }

    #[test]
    fn operation_without_logs_yields_empty_window() {
        let logs = vec![given_batch_start(), given_marker("A"), given_marker("B")];
        assert!(filter_logs(hash("B"), entry_point(), &logs)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn missing_target_marker_is_corrupt_stream() {
        let err = filter_logs(hash("D"), entry_point(), &batch()).unwrap_err();
        assert!(matches!(err, BundlerError::CorruptLogStream(_)));
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn ignores_markers_from_other_contracts() {
        let mut forged = given_marker("X");
        forged.address = Address::repeat_byte(0x02);
        let mut forged_target = given_marker("B");
        forged_target.address = Address::repeat_byte(0x02);

        let logs = vec![
            given_batch_start(),
            given_log("A1"),
            given_marker("A"),
            given_log("B1"),
            forged,
            forged_target,
            given_log("B2"),
            given_marker("B"),
        ];

        let filtered = filter_logs(hash("B"), entry_point(), &logs).unwrap();
        assert_eq!(filtered.len(), 4);
        assert_eq!(labels(&filtered[..1]), vec!["B1"]);
    }

    #[test]
    fn without_batch_start_window_opens_at_first_log() {
        let logs = vec![given_log("A1"), given_marker("A")];
        let filtered = filter_logs(hash("A"), entry_point(), &logs).unwrap();
        assert_eq!(labels(&filtered), vec!["A1"]);
    }

    fn given_handle_ops_tx(ops: Vec<PackedUserOperation>) -> Transaction {
        Transaction {
            hash: H256::repeat_byte(0x77),
            to: Some(entry_point()),
            input: IEntryPointCalls::HandleOps(HandleOpsCall {
                ops,
                beneficiary: Address::repeat_byte(0xbb),
            })
            .encode()
            .into(),
            block_hash: Some(H256::repeat_byte(0x88)),
            block_number: Some(U64::from(42)),
            ..Default::default()
        }
    }

    fn hash_param() -> String {
        format!("{:?}", hash("B"))
    }

    fn locator_with(
        event: Option<Log>,
        transaction: Option<Transaction>,
    ) -> OperationLocator<MockEntryPointLike> {
        let mut entry_point_mock = MockEntryPointLike::new();
        entry_point_mock.expect_address().return_const(entry_point());
        entry_point_mock
            .expect_get_user_operation_event()
            .returning(move |_| Ok(event.clone()));
        entry_point_mock
            .expect_get_transaction()
            .returning(move |_| Ok(transaction.clone()));
        OperationLocator::new(Arc::new(entry_point_mock))
    }

    #[tokio::test]
    async fn unknown_hash_is_not_an_error() {
        let locator = locator_with(None, None);

        assert!(locator.locate(&hash_param()).await.unwrap().is_none());
        assert!(locator
            .get_user_operation_by_hash(&hash_param())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn malformed_hash_is_invalid_params() {
        let locator = locator_with(None, None);
        let err = locator.locate("0x1234").await.unwrap_err();
        assert!(matches!(err, BundlerError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn locates_operation_by_sender_and_nonce() {
        let target = given_user_op();
        let mut other = given_user_op();
        other.nonce = U256::from(8);

        let event = given_completion(hash("B"), target.sender, target.nonce);
        let tx = given_handle_ops_tx(vec![other.pack(), target.pack()]);
        let locator = locator_with(Some(event), Some(tx));

        let found = locator
            .get_user_operation_by_hash(&hash_param())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.user_operation, RpcUserOperation::from(&target));
        assert_eq!(found.entry_point, entry_point());
        assert_eq!(found.transaction_hash, H256::repeat_byte(0x77));
        assert_eq!(found.block_number, U64::from(42));
    }

    #[tokio::test]
    async fn decodes_aggregated_bundles() {
        let target = given_user_op();
        let event = given_completion(hash("B"), target.sender, target.nonce);
        let mut tx = given_handle_ops_tx(vec![]);
        tx.input = IEntryPointCalls::HandleAggregatedOps(HandleAggregatedOpsCall {
            ops_per_aggregator: vec![UserOpsPerAggregator {
                user_ops: vec![target.pack()],
                aggregator: Address::repeat_byte(0xaa),
                signature: Bytes::new(),
            }],
            beneficiary: Address::zero(),
        })
        .encode()
        .into();

        let located = locator_with(Some(event), Some(tx))
            .locate(&hash_param())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(located.user_op, target);
    }

    #[tokio::test]
    async fn unmined_transaction_is_not_found() {
        let target = given_user_op();
        let event = given_completion(hash("B"), target.sender, target.nonce);
        let mut tx = given_handle_ops_tx(vec![target.pack()]);
        tx.block_hash = None;
        tx.block_number = None;

        let found = locator_with(Some(event), Some(tx))
            .get_user_operation_by_hash(&hash_param())
            .await
            .unwrap();

        assert!(found.is_none());
    }

    #[tokio::test]
    async fn transaction_to_another_contract_is_parse_error() {
        let target = given_user_op();
        let event = given_completion(hash("B"), target.sender, target.nonce);
        let mut tx = given_handle_ops_tx(vec![target.pack()]);
        tx.to = Some(Address::repeat_byte(0x99));

        let err = locator_with(Some(event), Some(tx))
            .locate(&hash_param())
            .await
            .unwrap_err();

        assert!(matches!(err, BundlerError::TransactionParse(ref m) if m == "unable to parse transaction"));
    }

    #[tokio::test]
    async fn non_bundle_input_is_parse_error() {
        let target = given_user_op();
        let event = given_completion(hash("B"), target.sender, target.nonce);
        let mut tx = given_handle_ops_tx(vec![target.pack()]);
        tx.input = Bytes::from(vec![0x12, 0x34, 0x56, 0x78]);

        let err = locator_with(Some(event), Some(tx))
            .locate(&hash_param())
            .await
            .unwrap_err();

        assert!(matches!(err, BundlerError::TransactionParse(ref m) if m == "failed to parse transaction"));
    }

    #[tokio::test]
    async fn operation_missing_from_its_bundle_is_parse_error() {
        let target = given_user_op();
        let mut other = given_user_op();
        other.sender = Address::repeat_byte(0x44);

        let event = given_completion(hash("B"), target.sender, target.nonce);
        let tx = given_handle_ops_tx(vec![other.pack()]);

        let err = locator_with(Some(event), Some(tx))
            .locate(&hash_param())
            .await
            .unwrap_err();

        assert!(err.is_invariant_violation());
        assert_eq!(err.to_string(), "unable to find userOp in transaction");
    }

    #[tokio::test]
    async fn builds_receipt_from_event_and_filtered_logs() {
        let target = given_user_op();
        let target_event = given_completion(hash("B"), target.sender, target.nonce);
        let receipt = TransactionReceipt {
            transaction_hash: H256::repeat_byte(0x77),
            logs: batch(),
            ..Default::default()
        };

        let mut entry_point_mock = MockEntryPointLike::new();
        entry_point_mock.expect_address().return_const(entry_point());
        entry_point_mock
            .expect_get_user_operation_event()
            .returning(move |_| Ok(Some(target_event.clone())));
        entry_point_mock
            .expect_get_transaction_receipt()
            .returning(move |_| Ok(Some(receipt.clone())));
        let locator = OperationLocator::new(Arc::new(entry_point_mock));

        let found = locator
            .get_user_operation_receipt(&hash_param())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.user_op_hash, hash("B"));
        assert_eq!(found.sender, target.sender);
        assert_eq!(found.nonce, target.nonce);
        assert_eq!(found.actual_gas_cost, U256::from(1_000));
        assert_eq!(found.actual_gas_used, U256::from(100));
        assert!(found.success);
        assert_eq!(labels(&found.logs), vec!["B1", "B2"]);
    }

    #[tokio::test]
    async fn receipt_for_unknown_hash_is_none() {
        let mut entry_point_mock = MockEntryPointLike::new();
        entry_point_mock
            .expect_get_user_operation_event()
            .returning(|_| Ok(None));
        entry_point_mock.expect_get_transaction_receipt().never();

        let found = OperationLocator::new(Arc::new(entry_point_mock))
            .get_user_operation_receipt(&hash_param())
            .await
            .unwrap();

        assert!(found.is_none());
    }
}
