// src/rpc.rs
use std::sync::Arc;

use ethers::types::{Address, H256};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use tracing::{debug, error};

use crate::bundler::Bundler;
use crate::entry_point::EntryPointLike;
use crate::error::BundlerError;
use crate::execution::ExecutionManager;
use crate::types::{
    GasEstimate, PaymasterResponse, RpcUserOperation, UserOperationByHash, UserOperationReceipt,
};

#[rpc(server)]
pub trait BundlerApi {
    #[method(name = "eth_supportedEntryPoints")]
    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>>;

    #[method(name = "eth_estimateUserOperationGas")]
    async fn estimate_user_operation_gas(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> RpcResult<GasEstimate>;

    #[method(name = "eth_sendUserOperation")]
    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> RpcResult<H256>;

    #[method(name = "eth_getUserOperationByHash")]
    async fn get_user_operation_by_hash(&self, hash: String)
        -> RpcResult<Option<UserOperationByHash>>;

    #[method(name = "eth_getUserOperationReceipt")]
    async fn get_user_operation_receipt(
        &self,
        hash: String,
    ) -> RpcResult<Option<UserOperationReceipt>>;

    #[method(name = "web3_clientVersion")]
    async fn client_version(&self) -> RpcResult<String>;

    /// Requests the paymaster to sponsor a user operation
    #[method(name = "pm_sponsorUserOperation")]
    async fn sponsor_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> RpcResult<PaymasterResponse>;
}

pub struct BundlerRpcImpl<E, X> {
    bundler: Arc<Bundler<E, X>>,
}

impl<E, X> BundlerRpcImpl<E, X> {
    pub fn new(bundler: Arc<Bundler<E, X>>) -> Self {
        Self { bundler }
    }
}

#[async_trait]
impl<E: EntryPointLike, X: ExecutionManager> BundlerApiServer for BundlerRpcImpl<E, X> {
    async fn supported_entry_points(&self) -> RpcResult<Vec<Address>> {
        Ok(self.bundler.supported_entry_points())
    }

    async fn estimate_user_operation_gas(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> RpcResult<GasEstimate> {
        debug!("Received gas estimation request for sender: {:?}", op.sender);
        self.bundler
            .estimate_user_operation_gas(op, entry_point)
            .await
            .map_err(|e| rpc_error("eth_estimateUserOperationGas", e))
    }

    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> RpcResult<H256> {
        debug!("Received user operation from sender: {:?}", op.sender);
        self.bundler
            .send_user_operation(op, entry_point)
            .await
            .map_err(|e| rpc_error("eth_sendUserOperation", e))
    }

    async fn get_user_operation_by_hash(
        &self,
        hash: String,
    ) -> RpcResult<Option<UserOperationByHash>> {
        debug!("Looking up user operation {}", hash);
        self.bundler
            .get_user_operation_by_hash(hash)
            .await
            .map_err(|e| rpc_error("eth_getUserOperationByHash", e))
    }

    async fn get_user_operation_receipt(
        &self,
        hash: String,
    ) -> RpcResult<Option<UserOperationReceipt>> {
        debug!("Looking up receipt of user operation {}", hash);
        self.bundler
            .get_user_operation_receipt(hash)
            .await
            .map_err(|e| rpc_error("eth_getUserOperationReceipt", e))
    }

    async fn client_version(&self) -> RpcResult<String> {
        Ok(self.bundler.client_version())
    }

    async fn sponsor_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Option<String>,
    ) -> RpcResult<PaymasterResponse> {
        debug!("Received sponsor request for sender: {:?}", op.sender);
        self.bundler
            .sponsor_user_operation(op, entry_point)
            .await
            .map_err(|e| rpc_error("pm_sponsorUserOperation", e))
    }
}

/// Logs a failed call at a level matching who is at fault and converts it for the wire.
fn rpc_error(method: &str, err: BundlerError) -> ErrorObjectOwned {
    match &err {
        BundlerError::Internal(_) => error!("{} failed: {:#}", method, err),
        _ if err.is_invariant_violation() => error!("{} hit an invariant violation: {}", method, err),
        _ => debug!("{} rejected: {}", method, err),
    }
    err.into()
}
