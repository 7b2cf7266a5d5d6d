// src/config.rs
use std::{fs, path::Path};

use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, Bytes, U256};

/// Immutable bundler settings shared by every component.
#[derive(Debug, Clone)]
pub struct BundlerConfig {
    pub entry_point: Address,
    /// Receives bundle refunds; `None` pays the operator.
    pub beneficiary: Option<Address>,
    /// Operator balance at or below which refunds go back to the operator.
    pub min_balance: U256,
    pub unsafe_mode: bool,
    pub paymaster: Option<Address>,
    pub paymaster_valid_duration: u64,
    /// Runtime bytecode injected at the entry point for simulation calls.
    pub simulation_code: Bytes,
}

impl BundlerConfig {
    pub fn client_version(&self) -> String {
        let mut version = format!("aa-bundler/{}", env!("CARGO_PKG_VERSION"));
        if self.unsafe_mode {
            version.push_str("/unsafe");
        }
        version
    }
}

/// Reads the runtime bytecode used to override the entry point during simulation.
pub fn load_simulation_code(path: &Path) -> Result<Bytes> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read simulation code at {}", path.display()))?;
    parse_bytecode(&raw)
        .with_context(|| format!("failed to parse simulation code at {}", path.display()))
}

fn parse_bytecode(raw: &str) -> Result<Bytes> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(anyhow!("bytecode is empty"));
    }
    Ok(Bytes::from(hex::decode(digits)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(unsafe_mode: bool) -> BundlerConfig {
        BundlerConfig {
            entry_point: Address::zero(),
            beneficiary: None,
            min_balance: U256::zero(),
            unsafe_mode,
            paymaster: None,
            paymaster_valid_duration: 3600,
            simulation_code: Bytes::from(vec![0x00]),
        }
    }

    #[test]
    fn client_version_marks_unsafe_mode() {
        let safe = config(false).client_version();
        assert!(safe.starts_with("aa-bundler/"));
        assert!(!safe.ends_with("/unsafe"));
        assert!(config(true).client_version().ends_with("/unsafe"));
    }

    #[test]
    fn parses_bytecode_file_contents() {
        assert_eq!(
            parse_bytecode("0x6080604052\n").unwrap(),
            Bytes::from(vec![0x60, 0x80, 0x60, 0x40, 0x52])
        );
        assert_eq!(
            parse_bytecode("6001").unwrap(),
            Bytes::from(vec![0x60, 0x01])
        );
        assert!(parse_bytecode("0x").is_err());
        assert!(parse_bytecode("0x123").is_err());
    }

    #[test]
    fn missing_simulation_code_file_is_an_error() {
        let path = std::env::temp_dir().join("aa-bundler-no-such-simulation-code.hex");
        let err = load_simulation_code(&path).unwrap_err();
        assert!(err.to_string().starts_with("failed to read simulation code"));
    }
}
