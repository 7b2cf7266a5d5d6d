// src/paymaster.rs
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use ethers::abi::{self, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U128, U256};
use ethers::utils::keccak256;
use tracing::debug;

use crate::error::BundlerError;
use crate::types::{PaymasterGroup, PaymasterResponse, UserOperation};

const PAYMASTER_VERIFICATION_GAS_LIMIT: u64 = 300_000;
const PAYMASTER_POST_OP_GAS_LIMIT: u64 = 0;

/// Signs sponsorship for a verifying paymaster that trusts the operator key.
pub struct PaymasterSigner {
    wallet: LocalWallet,
    pub paymaster_address: Address,
    chain_id: u64,
    // The validity time window in seconds
    valid_duration: u64,
}

impl PaymasterSigner {
    pub fn new(
        wallet: LocalWallet,
        paymaster_address: Address,
        chain_id: u64,
        valid_duration: u64,
    ) -> Self {
        Self {
            wallet,
            paymaster_address,
            chain_id,
            valid_duration,
        }
    }

    /// Fills the paymaster fields of `user_op`, valid from now for the configured duration.
    pub async fn sponsor(&self, user_op: &UserOperation) -> Result<PaymasterResponse, BundlerError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock is before the unix epoch")?
            .as_secs();

        self.sponsor_with_window(user_op, now + self.valid_duration, now)
            .await
    }

    async fn sponsor_with_window(
        &self,
        user_op: &UserOperation,
        valid_until: u64,
        valid_after: u64,
    ) -> Result<PaymasterResponse, BundlerError> {
        let mut op = user_op.clone();
        op.paymaster = Some(PaymasterGroup {
            paymaster: self.paymaster_address,
            verification_gas_limit: U128::from(PAYMASTER_VERIFICATION_GAS_LIMIT),
            post_op_gas_limit: U128::from(PAYMASTER_POST_OP_GAS_LIMIT),
            paymaster_data: Bytes::new(),
        });

        let hash = self.get_hash(&op, valid_until, valid_after);
        let signature = self
            .wallet
            .sign_message(hash)
            .await
            .context("should sign paymaster hash")?;
        debug!("Sponsoring {:?} until {}", op.sender, valid_until);

        let mut paymaster_data = abi::encode(&[
            Token::Uint(U256::from(valid_until)),
            Token::Uint(U256::from(valid_after)),
        ]);
        paymaster_data.extend_from_slice(&signature.to_vec());

        Ok(PaymasterResponse {
            paymaster: self.paymaster_address,
            paymaster_verification_gas_limit: U256::from(PAYMASTER_VERIFICATION_GAS_LIMIT),
            paymaster_post_op_gas_limit: U256::from(PAYMASTER_POST_OP_GAS_LIMIT),
            paymaster_data: Bytes::from(paymaster_data),
        })
    }

    /// The hash the verifying paymaster recomputes on chain; it covers every packed field except
    /// the signature and the paymaster data itself.
    pub fn get_hash(&self, op: &UserOperation, valid_until: u64, valid_after: u64) -> H256 {
        let packed = op.pack();

        let mut paymaster_gas = [0u8; 32];
        if packed.paymaster_and_data.len() >= 52 {
            paymaster_gas.copy_from_slice(&packed.paymaster_and_data[20..52]);
        }

        let encoded = abi::encode(&[
            Token::Address(packed.sender),
            Token::Uint(packed.nonce),
            Token::FixedBytes(keccak256(&packed.init_code).to_vec()),
            Token::FixedBytes(keccak256(&packed.call_data).to_vec()),
            Token::FixedBytes(packed.account_gas_limits.to_vec()),
            Token::Uint(U256::from_big_endian(&paymaster_gas)),
            Token::Uint(packed.pre_verification_gas),
            Token::FixedBytes(packed.gas_fees.to_vec()),
            Token::Uint(U256::from(self.chain_id)),
            Token::Address(self.paymaster_address),
            Token::Uint(U256::from(valid_until)),
            Token::Uint(U256::from(valid_after)),
        ]);
        H256::from(keccak256(encoded))
    }
}
