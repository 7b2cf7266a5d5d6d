// src/bundler.rs
use std::sync::Arc;

use ethers::types::{Address, H256};
use tracing::info;

use crate::config::BundlerConfig;
use crate::entry_point::EntryPointLike;
use crate::error::BundlerError;
use crate::estimation::GasEstimator;
use crate::events::OperationLocator;
use crate::execution::ExecutionManager;
use crate::paymaster::PaymasterSigner;
use crate::types::{
    GasEstimate, PaymasterResponse, RpcUserOperation, UserOperationByHash, UserOperationReceipt,
};
use crate::validation::FieldValidator;

/// The user operation API, independent of the transport it is served over.
pub struct Bundler<E, X> {
    config: BundlerConfig,
    entry_point: Arc<E>,
    validator: FieldValidator,
    estimator: GasEstimator<E>,
    locator: OperationLocator<E>,
    execution: Arc<X>,
    paymaster: Option<PaymasterSigner>,
}

impl<E: EntryPointLike, X: ExecutionManager> Bundler<E, X> {
    pub fn new(
        config: BundlerConfig,
        entry_point: Arc<E>,
        execution: Arc<X>,
        paymaster: Option<PaymasterSigner>,
    ) -> Self {
        let validator = FieldValidator::new(config.entry_point);
        Self {
            estimator: GasEstimator::new(Arc::clone(&entry_point), validator),
            locator: OperationLocator::new(Arc::clone(&entry_point)),
            config,
            entry_point,
            validator,
            execution,
            paymaster,
        }
    }

    pub fn supported_entry_points(&self) -> Vec<Address> {
        vec![self.config.entry_point]
    }

    pub async fn estimate_user_operation_gas(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> Result<GasEstimate, BundlerError> {
        self.estimator.estimate(op, entry_point.as_deref()).await
    }

    /// Validates `op` in full, hands it to the execution manager and returns its hash.
    pub async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> Result<H256, BundlerError> {
        let user_op = self
            .validator
            .validate(&op, entry_point.as_deref(), true, true)?;

        info!(
            "UserOperation: Sender={:?} Nonce={} EntryPoint={:?} Paymaster={:?}",
            user_op.sender,
            user_op.nonce,
            self.config.entry_point,
            user_op.paymaster.as_ref().map(|p| p.paymaster)
        );

        let packed = user_op.pack();
        self.execution
            .send_user_operation(user_op, self.config.entry_point)
            .await?;

        Ok(self.entry_point.get_user_op_hash(packed).await?)
    }

    pub async fn get_user_operation_by_hash(
        &self,
        hash: String,
    ) -> Result<Option<UserOperationByHash>, BundlerError> {
        self.locator.get_user_operation_by_hash(&hash).await
    }

    pub async fn get_user_operation_receipt(
        &self,
        hash: String,
    ) -> Result<Option<UserOperationReceipt>, BundlerError> {
        self.locator.get_user_operation_receipt(&hash).await
    }

    pub fn client_version(&self) -> String {
        self.config.client_version()
    }

    pub async fn sponsor_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> Result<PaymasterResponse, BundlerError> {
        let paymaster = self
            .paymaster
            .as_ref()
            .ok_or(BundlerError::PaymasterUnavailable)?;

        let user_op = self
            .validator
            .validate(&op, entry_point.as_deref(), false, false)?;
        paymaster.sponsor(&user_op).await
    }
}
