// src/types.rs
use anyhow::ensure;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U128, U256, U64};
use serde::{Deserialize, Serialize};

pub use crate::contracts::PackedUserOperation;

const ADDRESS_LEN: usize = 20;
const PAYMASTER_DATA_OFFSET: usize = 52;

/// UserOperation as it travels over JSON-RPC.
///
/// Every field is kept as the raw string the client sent so that absence and hex shape are
/// decided by the field validator rather than by the deserializer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcUserOperation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_gas_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_gas_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_verification_gas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryGroup {
    pub factory: Address,
    pub factory_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterGroup {
    pub paymaster: Address,
    pub verification_gas_limit: U128,
    pub post_op_gas_limit: U128,
    pub paymaster_data: Bytes,
}

/// Validated, typed UserOperation (EntryPoint v0.7 layout, unpacked).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub factory: Option<FactoryGroup>,
    pub call_data: Bytes,
    pub call_gas_limit: U128,
    pub verification_gas_limit: U128,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U128,
    pub max_priority_fee_per_gas: U128,
    pub paymaster: Option<PaymasterGroup>,
    pub signature: Bytes,
}

impl UserOperation {
    /// Encodes the operation into the struct the entry point consumes.
    pub fn pack(&self) -> PackedUserOperation {
        let init_code = match &self.factory {
            Some(group) => concat_bytes(group.factory.as_bytes(), &group.factory_data),
            None => Bytes::new(),
        };

        let paymaster_and_data = match &self.paymaster {
            Some(group) => {
                let mut data = group.paymaster.as_bytes().to_vec();
                data.extend_from_slice(&u128_be_bytes(group.verification_gas_limit));
                data.extend_from_slice(&u128_be_bytes(group.post_op_gas_limit));
                data.extend_from_slice(&group.paymaster_data);
                Bytes::from(data)
            }
            None => Bytes::new(),
        };

        PackedUserOperation {
            sender: self.sender,
            nonce: self.nonce,
            init_code,
            call_data: self.call_data.clone(),
            account_gas_limits: concat_128(self.verification_gas_limit, self.call_gas_limit),
            pre_verification_gas: self.pre_verification_gas,
            gas_fees: concat_128(self.max_priority_fee_per_gas, self.max_fee_per_gas),
            paymaster_and_data,
            signature: self.signature.clone(),
        }
    }
}

impl TryFrom<PackedUserOperation> for UserOperation {
    type Error = anyhow::Error;

    fn try_from(packed: PackedUserOperation) -> Result<Self, Self::Error> {
        let factory = if packed.init_code.is_empty() {
            None
        } else {
            ensure!(
                packed.init_code.len() >= ADDRESS_LEN,
                "initCode is shorter than an address"
            );
            Some(FactoryGroup {
                factory: Address::from_slice(&packed.init_code[..ADDRESS_LEN]),
                factory_data: Bytes::from(packed.init_code[ADDRESS_LEN..].to_vec()),
            })
        };

        let paymaster = if packed.paymaster_and_data.is_empty() {
            None
        } else {
            let data = &packed.paymaster_and_data;
            ensure!(
                data.len() >= PAYMASTER_DATA_OFFSET,
                "paymasterAndData is shorter than its fixed fields"
            );
            Some(PaymasterGroup {
                paymaster: Address::from_slice(&data[..ADDRESS_LEN]),
                verification_gas_limit: U128::from_big_endian(&data[ADDRESS_LEN..36]),
                post_op_gas_limit: U128::from_big_endian(&data[36..PAYMASTER_DATA_OFFSET]),
                paymaster_data: Bytes::from(data[PAYMASTER_DATA_OFFSET..].to_vec()),
            })
        };

        let (verification_gas_limit, call_gas_limit) = split_128(&packed.account_gas_limits);
        let (max_priority_fee_per_gas, max_fee_per_gas) = split_128(&packed.gas_fees);

        Ok(Self {
            sender: packed.sender,
            nonce: packed.nonce,
            factory,
            call_data: packed.call_data,
            call_gas_limit,
            verification_gas_limit,
            pre_verification_gas: packed.pre_verification_gas,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            paymaster,
            signature: packed.signature,
        })
    }
}

impl From<&UserOperation> for RpcUserOperation {
    fn from(op: &UserOperation) -> Self {
        Self {
            sender: Some(fmt_address(op.sender)),
            nonce: Some(fmt_quantity(op.nonce)),
            factory: op.factory.as_ref().map(|f| fmt_address(f.factory)),
            factory_data: op.factory.as_ref().map(|f| fmt_bytes(&f.factory_data)),
            call_data: Some(fmt_bytes(&op.call_data)),
            call_gas_limit: Some(fmt_quantity(op.call_gas_limit)),
            verification_gas_limit: Some(fmt_quantity(op.verification_gas_limit)),
            pre_verification_gas: Some(fmt_quantity(op.pre_verification_gas)),
            max_fee_per_gas: Some(fmt_quantity(op.max_fee_per_gas)),
            max_priority_fee_per_gas: Some(fmt_quantity(op.max_priority_fee_per_gas)),
            paymaster: op.paymaster.as_ref().map(|p| fmt_address(p.paymaster)),
            paymaster_verification_gas_limit: op
                .paymaster
                .as_ref()
                .map(|p| fmt_quantity(p.verification_gas_limit)),
            paymaster_post_op_gas_limit: op
                .paymaster
                .as_ref()
                .map(|p| fmt_quantity(p.post_op_gas_limit)),
            paymaster_data: op.paymaster.as_ref().map(|p| fmt_bytes(&p.paymaster_data)),
            signature: Some(fmt_bytes(&op.signature)),
        }
    }
}

/// Result of `eth_estimateUserOperationGas`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_after: Option<U64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<U64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationByHash {
    pub user_operation: RpcUserOperation,
    pub entry_point: Address,
    pub transaction_hash: H256,
    pub block_hash: H256,
    pub block_number: U64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    pub sender: Address,
    pub nonce: U256,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    pub success: bool,
    pub logs: Vec<Log>,
    pub receipt: TransactionReceipt,
}

/// Paymaster fields returned by `pm_sponsorUserOperation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterResponse {
    pub paymaster: Address,
    pub paymaster_verification_gas_limit: U256,
    pub paymaster_post_op_gas_limit: U256,
    pub paymaster_data: Bytes,
}

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_quantity<T: std::fmt::LowerHex>(v: T) -> String {
    format!("{v:#x}")
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

fn concat_bytes(head: &[u8], tail: &[u8]) -> Bytes {
    let mut bytes = head.to_vec();
    bytes.extend_from_slice(tail);
    Bytes::from(bytes)
}

fn u128_be_bytes(value: U128) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    value.to_big_endian(&mut bytes);
    bytes
}

fn concat_128(high: U128, low: U128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(&u128_be_bytes(high));
    word[16..].copy_from_slice(&u128_be_bytes(low));
    word
}

fn split_128(word: &[u8; 32]) -> (U128, U128) {
    (
        U128::from_big_endian(&word[..16]),
        U128::from_big_endian(&word[16..]),
    )
}
