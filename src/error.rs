// src/error.rs
use ethers::types::Address;
use jsonrpsee::types::{
    error::{INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE, METHOD_NOT_FOUND_CODE},
    ErrorObject, ErrorObjectOwned,
};
use thiserror::Error;

// Custom ERC-4337 error codes
pub const SIMULATE_VALIDATION_CODE: i32 = -32500;
pub const USER_OPERATION_REVERTED_CODE: i32 = -32521;

#[derive(Error, Debug)]
pub enum BundlerError {
    #[error("{0}")]
    InvalidParams(String),

    #[error("The EntryPoint at \"{declared}\" is not supported. This bundler uses {configured:?}")]
    ConfigMismatch { declared: String, configured: Address },

    #[error("{0}")]
    SimulationFailed(String),

    #[error("{0}")]
    ExecutionReverted(String),

    #[error("fatal: {0}")]
    CorruptLogStream(String),

    #[error("{0}")]
    TransactionParse(String),

    #[error("Paymaster not deployed")]
    PaymasterUnavailable,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BundlerError {
    pub fn code(&self) -> i32 {
        match self {
            BundlerError::InvalidParams(_) | BundlerError::ConfigMismatch { .. } => {
                INVALID_PARAMS_CODE
            }
            BundlerError::SimulationFailed(_) => SIMULATE_VALIDATION_CODE,
            BundlerError::ExecutionReverted(_) => USER_OPERATION_REVERTED_CODE,
            BundlerError::PaymasterUnavailable => METHOD_NOT_FOUND_CODE,
            BundlerError::CorruptLogStream(_)
            | BundlerError::TransactionParse(_)
            | BundlerError::Internal(_) => INTERNAL_ERROR_CODE,
        }
    }

    /// Errors that can only come from an inconsistency between the chain and what the entry
    /// point guarantees, never from bad user input.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            BundlerError::CorruptLogStream(_) | BundlerError::TransactionParse(_)
        )
    }
}

impl From<BundlerError> for ErrorObjectOwned {
    fn from(error: BundlerError) -> Self {
        ErrorObject::owned(error.code(), error.to_string(), None::<()>)
    }
}
