// src/validation.rs
use ethers::types::{Address, Bytes, H256, U128, U256};

use crate::error::BundlerError;
use crate::types::{fmt_address, FactoryGroup, PaymasterGroup, RpcUserOperation, UserOperation};

#[derive(Clone, Copy)]
struct Field {
    name: &'static str,
    value: fn(&RpcUserOperation) -> Option<&str>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RequiredWhen {
    Always,
    SignatureRequired,
    GasFieldsRequired,
}

/// Fields whose presence depends only on the validation flags.
const BASE_FIELDS: &[(Field, RequiredWhen)] = &[
    (
        Field { name: "sender", value: |op| op.sender.as_deref() },
        RequiredWhen::Always,
    ),
    (
        Field { name: "nonce", value: |op| op.nonce.as_deref() },
        RequiredWhen::Always,
    ),
    (
        Field { name: "callData", value: |op| op.call_data.as_deref() },
        RequiredWhen::Always,
    ),
    (
        Field { name: "signature", value: |op| op.signature.as_deref() },
        RequiredWhen::SignatureRequired,
    ),
    (
        Field { name: "preVerificationGas", value: |op| op.pre_verification_gas.as_deref() },
        RequiredWhen::GasFieldsRequired,
    ),
    (
        Field { name: "verificationGasLimit", value: |op| op.verification_gas_limit.as_deref() },
        RequiredWhen::GasFieldsRequired,
    ),
    (
        Field { name: "callGasLimit", value: |op| op.call_gas_limit.as_deref() },
        RequiredWhen::GasFieldsRequired,
    ),
    (
        Field { name: "maxFeePerGas", value: |op| op.max_fee_per_gas.as_deref() },
        RequiredWhen::GasFieldsRequired,
    ),
    (
        Field { name: "maxPriorityFeePerGas", value: |op| op.max_priority_fee_per_gas.as_deref() },
        RequiredWhen::GasFieldsRequired,
    ),
];

/// A group of fields that only matter when its address field is set.
struct FieldGroup {
    address: Field,
    co_required: &'static [Field],
    optional: &'static [Field],
}

const PAYMASTER_GROUP: FieldGroup = FieldGroup {
    address: Field { name: "paymaster", value: |op| op.paymaster.as_deref() },
    co_required: &[
        Field {
            name: "paymasterPostOpGasLimit",
            value: |op| op.paymaster_post_op_gas_limit.as_deref(),
        },
        Field {
            name: "paymasterVerificationGasLimit",
            value: |op| op.paymaster_verification_gas_limit.as_deref(),
        },
    ],
    optional: &[Field { name: "paymasterData", value: |op| op.paymaster_data.as_deref() }],
};

const FACTORY_GROUP: FieldGroup = FieldGroup {
    address: Field { name: "factory", value: |op| op.factory.as_deref() },
    co_required: &[Field { name: "factoryData", value: |op| op.factory_data.as_deref() }],
    optional: &[],
};

/// Structural checks on incoming user operations.
#[derive(Debug, Clone, Copy)]
pub struct FieldValidator {
    entry_point: Address,
}

impl FieldValidator {
    pub fn new(entry_point: Address) -> Self {
        Self { entry_point }
    }

    pub fn check_entry_point(&self, declared: Option<&str>) -> Result<(), BundlerError> {
        let declared = declared
            .ok_or_else(|| BundlerError::InvalidParams("No entryPoint param".to_string()))?;

        if !declared.eq_ignore_ascii_case(&fmt_address(self.entry_point)) {
            return Err(BundlerError::ConfigMismatch {
                declared: declared.to_string(),
                configured: self.entry_point,
            });
        }
        Ok(())
    }

    /// Checks the declared entry point, field presence and hex shape, then converts the wire
    /// form into a typed operation. Gas fields that were allowed to be absent become zero.
    pub fn validate(
        &self,
        op: &RpcUserOperation,
        declared_entry_point: Option<&str>,
        require_signature: bool,
        require_gas_fields: bool,
    ) -> Result<UserOperation, BundlerError> {
        self.check_entry_point(declared_entry_point)?;

        for (field, required_when) in BASE_FIELDS {
            let required = match required_when {
                RequiredWhen::Always => true,
                RequiredWhen::SignatureRequired => require_signature,
                RequiredWhen::GasFieldsRequired => require_gas_fields,
            };
            if required {
                require_hex_field(op, field)?;
            }
        }
        require_group(op, &PAYMASTER_GROUP)?;
        require_group(op, &FACTORY_GROUP)?;

        to_user_operation(op)
    }
}

/// `0x` followed by zero or more hex digits, case-insensitive.
pub fn is_hex(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() >= 2
        && bytes[0] == b'0'
        && bytes[1].eq_ignore_ascii_case(&b'x')
        && bytes[2..].iter().all(u8::is_ascii_hexdigit)
}

/// Parses a user operation hash parameter: hex, exactly 32 bytes.
pub fn parse_hash(value: &str) -> Result<H256, BundlerError> {
    let invalid = || BundlerError::InvalidParams(format!("Invalid hash value: {value}"));
    if !is_hex(value) {
        return Err(invalid());
    }
    match hex::decode(strip_hex_prefix(value)) {
        Ok(bytes) if bytes.len() == 32 => Ok(H256::from_slice(&bytes)),
        _ => Err(invalid()),
    }
}

fn require_hex_field(op: &RpcUserOperation, field: &Field) -> Result<(), BundlerError> {
    let value = (field.value)(op).ok_or_else(|| {
        BundlerError::InvalidParams(format!("Missing userOp field: {}", field.name))
    })?;
    check_hex(field.name, value)
}

fn check_hex(name: &str, value: &str) -> Result<(), BundlerError> {
    if !is_hex(value) {
        return Err(BundlerError::InvalidParams(format!(
            "Invalid hex value for property {name}:{value} in UserOp"
        )));
    }
    Ok(())
}

fn require_group(op: &RpcUserOperation, group: &FieldGroup) -> Result<(), BundlerError> {
    let Some(address) = (group.address.value)(op) else {
        return Ok(());
    };
    check_hex(group.address.name, address)?;

    for field in group.co_required {
        let value = (field.value)(op).ok_or_else(|| {
            BundlerError::InvalidParams(format!(
                "got {} but missing {}",
                group.address.name, field.name
            ))
        })?;
        check_hex(field.name, value)?;
    }
    for field in group.optional {
        if let Some(value) = (field.value)(op) {
            check_hex(field.name, value)?;
        }
    }
    Ok(())
}

fn to_user_operation(op: &RpcUserOperation) -> Result<UserOperation, BundlerError> {
    let factory = match op.factory.as_deref() {
        Some(factory) => Some(FactoryGroup {
            factory: parse_address("factory", factory)?,
            factory_data: parse_bytes("factoryData", op.factory_data.as_deref())?,
        }),
        None => None,
    };

    let paymaster = match op.paymaster.as_deref() {
        Some(paymaster) => Some(PaymasterGroup {
            paymaster: parse_address("paymaster", paymaster)?,
            verification_gas_limit: parse_u128(
                "paymasterVerificationGasLimit",
                op.paymaster_verification_gas_limit.as_deref(),
            )?,
            post_op_gas_limit: parse_u128(
                "paymasterPostOpGasLimit",
                op.paymaster_post_op_gas_limit.as_deref(),
            )?,
            paymaster_data: parse_bytes("paymasterData", op.paymaster_data.as_deref())?,
        }),
        None => None,
    };

    let sender = op
        .sender
        .as_deref()
        .ok_or_else(|| BundlerError::InvalidParams("Missing userOp field: sender".to_string()))?;

    Ok(UserOperation {
        sender: parse_address("sender", sender)?,
        nonce: parse_u256("nonce", op.nonce.as_deref())?,
        factory,
        call_data: parse_bytes("callData", op.call_data.as_deref())?,
        call_gas_limit: parse_u128("callGasLimit", op.call_gas_limit.as_deref())?,
        verification_gas_limit: parse_u128(
            "verificationGasLimit",
            op.verification_gas_limit.as_deref(),
        )?,
        pre_verification_gas: parse_u256(
            "preVerificationGas",
            op.pre_verification_gas.as_deref(),
        )?,
        max_fee_per_gas: parse_u128("maxFeePerGas", op.max_fee_per_gas.as_deref())?,
        max_priority_fee_per_gas: parse_u128(
            "maxPriorityFeePerGas",
            op.max_priority_fee_per_gas.as_deref(),
        )?,
        paymaster,
        signature: parse_bytes("signature", op.signature.as_deref())?,
    })
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

fn parse_address(name: &str, value: &str) -> Result<Address, BundlerError> {
    let bytes = hex::decode(strip_hex_prefix(value)).ok();
    match bytes {
        Some(bytes) if bytes.len() == 20 => Ok(Address::from_slice(&bytes)),
        _ => Err(BundlerError::InvalidParams(format!(
            "Invalid address for property {name}:{value} in UserOp"
        ))),
    }
}

fn parse_bytes(name: &str, value: Option<&str>) -> Result<Bytes, BundlerError> {
    let Some(value) = value else {
        return Ok(Bytes::new());
    };
    hex::decode(strip_hex_prefix(value))
        .map(Bytes::from)
        .map_err(|_| {
            BundlerError::InvalidParams(format!(
                "Invalid byte string for property {name}:{value} in UserOp"
            ))
        })
}

// Leading zeros are dropped first: the radix parsers bound the digit count, not the value.
fn significant_digits(value: Option<&str>) -> &str {
    value
        .map(strip_hex_prefix)
        .unwrap_or_default()
        .trim_start_matches('0')
}

fn parse_u256(name: &str, value: Option<&str>) -> Result<U256, BundlerError> {
    match significant_digits(value) {
        "" => Ok(U256::zero()),
        digits => U256::from_str_radix(digits, 16).map_err(|_| out_of_range(name)),
    }
}

fn parse_u128(name: &str, value: Option<&str>) -> Result<U128, BundlerError> {
    match significant_digits(value) {
        "" => Ok(U128::zero()),
        digits => U128::from_str_radix(digits, 16).map_err(|_| out_of_range(name)),
    }
}

fn out_of_range(name: &str) -> BundlerError {
    BundlerError::InvalidParams(format!("Value out of range for property {name} in UserOp"))
}
