// src/estimation.rs
use std::sync::Arc;

use ethers::types::U64;
use tracing::debug;

use crate::entry_point::EntryPointLike;
use crate::error::BundlerError;
use crate::gas::calc_pre_verification_gas;
use crate::types::{GasEstimate, RpcUserOperation};
use crate::validation::FieldValidator;
use crate::validation_data::merge_validation_data_values;

/// Placeholder verification gas limit, large enough for any realistic validation.
const DEFAULT_VERIFICATION_GAS_LIMIT: &str = "0x989680";
const ZERO: &str = "0x0";
const EXECUTION_REVERTED: &str = "execution reverted";

pub struct GasEstimator<E> {
    entry_point: Arc<E>,
    validator: FieldValidator,
}

impl<E: EntryPointLike> GasEstimator<E> {
    pub fn new(entry_point: Arc<E>, validator: FieldValidator) -> Self {
        Self {
            entry_point,
            validator,
        }
    }

    /// Estimates the gas fields of a partially filled operation by simulating it.
    pub async fn estimate(
        &self,
        op: RpcUserOperation,
        declared_entry_point: Option<&str>,
    ) -> Result<GasEstimate, BundlerError> {
        // 1. Make the operation simulatable
        let op = fill_estimation_defaults(op);

        // 2. Shape checks, gas fields are what is being estimated
        let user_op = self
            .validator
            .validate(&op, declared_entry_point, true, false)?;

        // 3. Dry-run the whole operation
        let result = self
            .entry_point
            .simulate_handle_op(user_op.pack())
            .await
            .map_err(|e| BundlerError::SimulationFailed(e.reason.unwrap_or(e.message)))?;

        // 4. Validity window from both validation data words
        let validation = merge_validation_data_values(
            result.account_validation_data,
            result.paymaster_validation_data,
        );

        // 5. Execution gas, measured directly against the account
        let call_gas_limit = self
            .entry_point
            .estimate_call_gas(user_op.sender, user_op.call_data.clone())
            .await
            .map_err(|e| {
                BundlerError::ExecutionReverted(
                    e.reason.unwrap_or_else(|| EXECUTION_REVERTED.to_string()),
                )
            })?;

        let pre_verification_gas = calc_pre_verification_gas(&user_op);
        debug!(
            "Estimated {:?}: preOpGas {}, callGas {}, preVerificationGas {}",
            user_op.sender, result.pre_op_gas, call_gas_limit, pre_verification_gas
        );

        Ok(GasEstimate {
            pre_verification_gas,
            verification_gas_limit: result.pre_op_gas,
            call_gas_limit,
            valid_after: Some(U64::from(validation.valid_after)),
            valid_until: Some(U64::from(validation.valid_until)),
        })
    }
}

fn fill_estimation_defaults(mut op: RpcUserOperation) -> RpcUserOperation {
    for field in [
        &mut op.max_fee_per_gas,
        &mut op.max_priority_fee_per_gas,
        &mut op.pre_verification_gas,
        &mut op.call_gas_limit,
    ] {
        field.get_or_insert_with(|| ZERO.to_string());
    }
    op.verification_gas_limit
        .get_or_insert_with(|| DEFAULT_VERIFICATION_GAS_LIMIT.to_string());
    op
}

#[cfg(test)]
mod tests {
    use ethers::types::{Address, Bytes, U128, U256};

    use super::*;
    use crate::contracts::ExecutionResult;
    use crate::entry_point::{CallError, MockEntryPointLike};
    use crate::validation_data::{ValidationData, MAX_UINT48};

    const ENTRY_POINT: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

    fn entry_point_address() -> Address {
        ENTRY_POINT.parse().unwrap()
    }

    fn partial_op() -> RpcUserOperation {
        RpcUserOperation {
            sender: Some("0x1306b01bC3e4AD202612D3843387e94737673F53".into()),
            nonce: Some("0x0".into()),
            call_data: Some("0xb61d27f6".into()),
            signature: Some("0x".into()),
            ..Default::default()
        }
    }

    fn execution_result(pre_op_gas: u64, account: U256, paymaster: U256) -> ExecutionResult {
        ExecutionResult {
            pre_op_gas: U256::from(pre_op_gas),
            paid: U256::zero(),
            account_validation_data: account,
            paymaster_validation_data: paymaster,
            target_success: true,
            target_result: Bytes::new(),
        }
    }

    fn estimator(entry_point: MockEntryPointLike) -> GasEstimator<MockEntryPointLike> {
        GasEstimator::new(
            Arc::new(entry_point),
            FieldValidator::new(entry_point_address()),
        )
    }

    #[tokio::test]
    async fn estimates_all_gas_fields() {
        let mut entry_point = MockEntryPointLike::new();
        entry_point
            .expect_simulate_handle_op()
            .withf(|op| {
                // defaults are in place when simulating
                U128::from_big_endian(&op.account_gas_limits[..16]) == U128::from(10_000_000)
            })
            .returning(|_| Ok(execution_result(45_000, U256::zero(), U256::zero())));
        entry_point
            .expect_estimate_call_gas()
            .returning(|_, _| Ok(U256::from(30_000)));

        let estimate = estimator(entry_point)
            .estimate(partial_op(), Some(ENTRY_POINT))
            .await
            .unwrap();

        assert_eq!(estimate.verification_gas_limit, U256::from(45_000));
        assert_eq!(estimate.call_gas_limit, U256::from(30_000));
        assert!(estimate.pre_verification_gas > U256::from(21_000 + 18_300));
        assert_eq!(estimate.valid_after, Some(U64::zero()));
        assert_eq!(estimate.valid_until, Some(U64::from(MAX_UINT48)));
    }

    #[tokio::test]
    async fn returns_merged_validity_window() {
        let account = ValidationData {
            aggregator: Address::zero(),
            valid_after: 5,
            valid_until: 100,
        }
        .pack();
        let paymaster = ValidationData {
            aggregator: Address::zero(),
            valid_after: 10,
            valid_until: 80,
        }
        .pack();

        let mut entry_point = MockEntryPointLike::new();
        entry_point
            .expect_simulate_handle_op()
            .returning(move |_| Ok(execution_result(1, account, paymaster)));
        entry_point
            .expect_estimate_call_gas()
            .returning(|_, _| Ok(U256::from(1)));

        let estimate = estimator(entry_point)
            .estimate(partial_op(), Some(ENTRY_POINT))
            .await
            .unwrap();

        assert_eq!(estimate.valid_after, Some(U64::from(10)));
        assert_eq!(estimate.valid_until, Some(U64::from(80)));
    }

    #[tokio::test]
    async fn simulation_revert_is_simulation_failed() {
        let mut entry_point = MockEntryPointLike::new();
        entry_point.expect_simulate_handle_op().returning(|_| {
            Err(CallError {
                message: "execution reverted".to_string(),
                reason: Some("AA21 didn't pay prefund".to_string()),
            })
        });
        entry_point.expect_estimate_call_gas().never();

        let err = estimator(entry_point)
            .estimate(partial_op(), Some(ENTRY_POINT))
            .await
            .unwrap_err();

        assert!(matches!(err, BundlerError::SimulationFailed(ref m) if m == "AA21 didn't pay prefund"));
    }

    #[tokio::test]
    async fn call_revert_is_execution_reverted_with_reason() {
        let mut entry_point = MockEntryPointLike::new();
        entry_point
            .expect_simulate_handle_op()
            .returning(|_| Ok(execution_result(1, U256::zero(), U256::zero())));
        entry_point.expect_estimate_call_gas().returning(|_, _| {
            Err(CallError::new("execution reverted: not owner", None))
        });

        let err = estimator(entry_point)
            .estimate(partial_op(), Some(ENTRY_POINT))
            .await
            .unwrap_err();

        assert!(matches!(err, BundlerError::ExecutionReverted(ref m) if m == "not owner"));
    }

    #[tokio::test]
    async fn call_revert_without_reason_uses_generic_message() {
        let mut entry_point = MockEntryPointLike::new();
        entry_point
            .expect_simulate_handle_op()
            .returning(|_| Ok(execution_result(1, U256::zero(), U256::zero())));
        entry_point.expect_estimate_call_gas().returning(|_, _| {
            Err(CallError {
                message: "gas required exceeds allowance".to_string(),
                reason: None,
            })
        });

        let err = estimator(entry_point)
            .estimate(partial_op(), Some(ENTRY_POINT))
            .await
            .unwrap_err();

        assert!(matches!(err, BundlerError::ExecutionReverted(ref m) if m == "execution reverted"));
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_the_chain() {
        let mut entry_point = MockEntryPointLike::new();
        entry_point.expect_simulate_handle_op().never();
        entry_point.expect_estimate_call_gas().never();

        let mut op = partial_op();
        op.sender = None;

        let err = estimator(entry_point)
            .estimate(op, Some(ENTRY_POINT))
            .await
            .unwrap_err();

        assert!(matches!(err, BundlerError::InvalidParams(_)));
    }

    #[test]
    fn defaults_do_not_override_client_values() {
        let mut op = partial_op();
        op.call_gas_limit = Some("0x1234".into());

        let filled = fill_estimation_defaults(op);

        assert_eq!(filled.call_gas_limit.as_deref(), Some("0x1234"));
        assert_eq!(filled.max_fee_per_gas.as_deref(), Some("0x0"));
        assert_eq!(filled.verification_gas_limit.as_deref(), Some("0x989680"));
    }
}
