// src/entry_point.rs
//! Every read the bundler makes against the chain goes through [`EntryPointLike`].

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use ethers::{
    abi::AbiDecode,
    contract::{ContractError, EthError, EthEvent},
    providers::{Middleware, MiddlewareError, RawCall},
    types::{
        spoof, transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes,
        Eip1559TransactionRequest, Filter, Log, Transaction, TransactionReceipt, H256, U256,
    },
};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::contracts::{ExecutionResult, IEntryPoint, UserOperationEventFilter};
use crate::types::PackedUserOperation;

/// A failed `eth_call` or `eth_estimateGas`, with the revert reason when one could be recovered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CallError {
    pub message: String,
    pub reason: Option<String>,
}

impl CallError {
    pub fn new(message: impl Into<String>, revert_data: Option<&[u8]>) -> Self {
        let message = message.into();
        let reason = revert_data
            .and_then(decode_revert_reason)
            .or_else(|| parse_reason_from_message(&message));
        Self { message, reason }
    }

    fn from_middleware_error<E: MiddlewareError>(error: &E) -> Self {
        let revert_data = error
            .as_error_response()
            .and_then(|response| response.as_revert_data());
        Self::new(error.to_string(), revert_data.as_deref())
    }

    fn from_contract_error<M: Middleware>(error: ContractError<M>) -> Self {
        match &error {
            ContractError::Revert(data) => Self::new(error.to_string(), Some(&data[..])),
            ContractError::MiddlewareError { e } => Self::from_middleware_error(e),
            _ => Self::new(error.to_string(), None),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntryPointLike: Send + Sync + 'static {
    fn address(&self) -> Address;

    /// Dry-runs the operation against a zero target with empty call data.
    async fn simulate_handle_op(
        &self,
        op: PackedUserOperation,
    ) -> Result<ExecutionResult, CallError>;

    /// Estimates the gas of `call_data` executed on `sender`, called from the entry point.
    async fn estimate_call_gas(&self, sender: Address, call_data: Bytes) -> Result<U256, CallError>;

    async fn get_user_op_hash(&self, op: PackedUserOperation) -> anyhow::Result<H256>;

    /// First `UserOperationEvent` the entry point emitted for `hash`, if any.
    async fn get_user_operation_event(&self, hash: H256) -> anyhow::Result<Option<Log>>;

    async fn get_transaction(&self, hash: H256) -> anyhow::Result<Option<Transaction>>;

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> anyhow::Result<Option<TransactionReceipt>>;
}

pub struct EntryPoint<M> {
    i_entry_point: IEntryPoint<M>,
    provider: Arc<M>,
    simulation_code: Bytes,
}

impl<M: Middleware + 'static> EntryPoint<M> {
    /// `simulation_code` replaces the entry point's code for the duration of every simulation
    /// call, since the deployed entry point has no `simulateHandleOp`.
    pub fn new(address: Address, provider: Arc<M>, simulation_code: Bytes) -> Self {
        Self {
            i_entry_point: IEntryPoint::new(address, Arc::clone(&provider)),
            provider,
            simulation_code,
        }
    }

    fn simulation_state(&self) -> spoof::State {
        let mut state = spoof::state();
        state
            .account(self.address())
            .code(self.simulation_code.clone());
        state
    }

    fn call_gas_request(&self, sender: Address, call_data: Bytes) -> TypedTransaction {
        Eip1559TransactionRequest::new()
            .from(self.address())
            .to(sender)
            .data(call_data)
            .into()
    }
}

#[async_trait]
impl<M: Middleware + 'static> EntryPointLike for EntryPoint<M> {
    fn address(&self) -> Address {
        self.i_entry_point.address()
    }

    async fn simulate_handle_op(
        &self,
        op: PackedUserOperation,
    ) -> Result<ExecutionResult, CallError> {
        let call = self
            .i_entry_point
            .simulate_handle_op(op, Address::zero(), Bytes::new());
        let state = self.simulation_state();

        call.call_raw()
            .state(&state)
            .await
            .map(
                |(
                    pre_op_gas,
                    paid,
                    account_validation_data,
                    paymaster_validation_data,
                    target_success,
                    target_result,
                )| ExecutionResult {
                    pre_op_gas,
                    paid,
                    account_validation_data,
                    paymaster_validation_data,
                    target_success,
                    target_result,
                },
            )
            .map_err(CallError::from_contract_error)
    }

    async fn estimate_call_gas(&self, sender: Address, call_data: Bytes) -> Result<U256, CallError> {
        let tx = self.call_gas_request(sender, call_data);

        self.provider
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| CallError::from_middleware_error(&e))
    }

    async fn get_user_op_hash(&self, op: PackedUserOperation) -> anyhow::Result<H256> {
        let hash = self
            .i_entry_point
            .get_user_op_hash(op)
            .call()
            .await
            .context("entry point should return the user op hash")?;
        Ok(H256::from(hash))
    }

    async fn get_user_operation_event(&self, hash: H256) -> anyhow::Result<Option<Log>> {
        let filter = Filter::new()
            .address(self.address())
            .topic0(UserOperationEventFilter::signature())
            .topic1(hash)
            .from_block(BlockNumber::Earliest);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .context("should query UserOperationEvent logs")?;
        Ok(logs.into_iter().next())
    }

    async fn get_transaction(&self, hash: H256) -> anyhow::Result<Option<Transaction>> {
        self.provider
            .get_transaction(hash)
            .await
            .context("should fetch transaction")
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> anyhow::Result<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .context("should fetch transaction receipt")
    }
}

/// The abi for what happens when you just `revert("message")` in a contract
#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "Error", abi = "Error(string)")]
pub struct ContractRevertError {
    pub reason: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "FailedOp", abi = "FailedOp(uint256,string)")]
pub struct FailedOp {
    pub op_index: U256,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, EthError)]
#[etherror(name = "FailedOpWithRevert", abi = "FailedOpWithRevert(uint256,string,bytes)")]
pub struct FailedOpWithRevert {
    pub op_index: U256,
    pub reason: String,
    pub inner: Bytes,
}

/// Decodes the revert payloads the entry point and plain `require`s produce.
pub fn decode_revert_reason(revert_data: &[u8]) -> Option<String> {
    if let Ok(err) = ContractRevertError::decode(revert_data) {
        return Some(err.reason);
    }
    if let Ok(err) = FailedOp::decode(revert_data) {
        return Some(err.reason);
    }
    if let Ok(err) = FailedOpWithRevert::decode(revert_data) {
        let inner = decode_revert_reason(&err.inner)
            .unwrap_or_else(|| format!("0x{}", hex::encode(&err.inner)));
        return Some(format!("{} {}", err.reason, inner));
    }
    None
}

/// Pulls a revert reason out of a node's error message when no revert data came with it.
pub fn parse_reason_from_message(message: &str) -> Option<String> {
    if let Some((_, rest)) = message.split_once("reason=\"") {
        let reason = rest.split('"').next().unwrap_or_default();
        return Some(reason.to_string());
    }
    message
        .split_once("execution reverted: ")
        .map(|(_, reason)| reason.to_string())
}
