// src/execution.rs
use std::sync::Arc;

use anyhow::{ensure, Context};
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, U256};
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::contracts::IEntryPoint;
use crate::types::UserOperation;

/// Hand-off point for validated user operations. Queuing and bundling policy live behind it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecutionManager: Send + Sync + 'static {
    async fn send_user_operation(
        &self,
        op: UserOperation,
        entry_point: Address,
    ) -> anyhow::Result<()>;
}

/// Sends every operation in its own `handleOps` bundle, one at a time.
pub struct BundleSender<M> {
    client: Arc<M>,
    entry_point: IEntryPoint<M>,
    operator: Address,
    beneficiary: Address,
    min_balance: U256,
    send_lock: Mutex<()>,
}

impl<M: Middleware + 'static> BundleSender<M> {
    /// `client` must sign as `operator`.
    pub fn new(
        client: Arc<M>,
        entry_point: Address,
        operator: Address,
        beneficiary: Address,
        min_balance: U256,
    ) -> Self {
        Self {
            entry_point: IEntryPoint::new(entry_point, Arc::clone(&client)),
            client,
            operator,
            beneficiary,
            min_balance,
            send_lock: Mutex::new(()),
        }
    }

    /// Pays the bundle out to the operator itself while its balance is at or below the minimum.
    pub async fn select_beneficiary(&self) -> anyhow::Result<Address> {
        let balance = self
            .client
            .get_balance(self.operator, None)
            .await
            .context("should fetch operator balance")?;

        if balance <= self.min_balance {
            warn!(
                "Low balance {}. Using {:?} as beneficiary instead of {:?}",
                balance, self.operator, self.beneficiary
            );
            return Ok(self.operator);
        }
        Ok(self.beneficiary)
    }
}

#[async_trait]
impl<M: Middleware + 'static> ExecutionManager for BundleSender<M> {
    async fn send_user_operation(
        &self,
        op: UserOperation,
        entry_point: Address,
    ) -> anyhow::Result<()> {
        ensure!(
            entry_point == self.entry_point.address(),
            "bundle sender is bound to entry point {:?}",
            self.entry_point.address()
        );

        let _guard = self.send_lock.lock().await;
        let beneficiary = self.select_beneficiary().await?;

        let call = self.entry_point.handle_ops(vec![op.pack()], beneficiary);
        let pending = call.send().await.context("should send handleOps bundle")?;
        info!(
            "Sent bundle {:?} for sender {:?} nonce {}",
            pending.tx_hash(),
            op.sender,
            op.nonce
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ethers::providers::{MockProvider, Provider};

    use super::*;
    use crate::types::tests::given_user_op;

    fn sender_with_balance(balance: u64) -> BundleSender<Provider<MockProvider>> {
        let (provider, mock) = Provider::mocked();
        mock.push(U256::from(balance)).unwrap();

        BundleSender::new(
            Arc::new(provider),
            Address::repeat_byte(0xee),
            Address::repeat_byte(0x0a),
            Address::repeat_byte(0x0b),
            U256::from(1_000),
        )
    }

    #[tokio::test]
    async fn keeps_configured_beneficiary_above_min_balance() {
        let sender = sender_with_balance(1_001);
        assert_eq!(
            sender.select_beneficiary().await.unwrap(),
            Address::repeat_byte(0x0b)
        );
    }

    #[tokio::test]
    async fn redirects_to_operator_at_min_balance() {
        let sender = sender_with_balance(1_000);
        assert_eq!(
            sender.select_beneficiary().await.unwrap(),
            Address::repeat_byte(0x0a)
        );
    }

    #[tokio::test]
    async fn rejects_foreign_entry_point() {
        let sender = sender_with_balance(1_001);
        let err = sender
            .send_user_operation(given_user_op(), Address::repeat_byte(0x01))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bound to entry point"));
    }
}
