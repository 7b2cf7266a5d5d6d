// src/validation_data.rs
//! Packed validation data returned by account and paymaster validation.
//!
//! Big-endian layout of the 256-bit word: `validAfter` in bytes 0..6, `validUntil` in bytes 6..12
//! and the aggregator address in bytes 12..32.

use ethers::types::{Address, H160, U256};

/// Largest value representable in the 48-bit time fields.
pub const MAX_UINT48: u64 = (1 << 48) - 1;

/// Aggregator value signalling that signature validation failed.
pub const SIG_VALIDATION_FAILED: Address = H160([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationData {
    pub aggregator: Address,
    pub valid_after: u64,
    pub valid_until: u64,
}

/// Decodes a validation data word. A zero `validUntil` means "no upper bound" and decodes to
/// [`MAX_UINT48`].
pub fn parse_validation_data(data: U256) -> ValidationData {
    let mut word = [0u8; 32];
    data.to_big_endian(&mut word);

    let valid_after = read_uint48(&word[..6]);
    let valid_until = match read_uint48(&word[6..12]) {
        0 => MAX_UINT48,
        until => until,
    };

    ValidationData {
        aggregator: Address::from_slice(&word[12..]),
        valid_after,
        valid_until,
    }
}

impl ValidationData {
    /// Inverse of [`parse_validation_data`]. Time fields wider than 48 bits are truncated.
    #[cfg(test)]
    pub fn pack(&self) -> U256 {
        let mut word = [0u8; 32];
        word[..6].copy_from_slice(&self.valid_after.to_be_bytes()[2..]);
        word[6..12].copy_from_slice(&self.valid_until.to_be_bytes()[2..]);
        word[12..].copy_from_slice(self.aggregator.as_bytes());
        U256::from_big_endian(&word)
    }

    /// Intersects the account's and the paymaster's validity windows.
    ///
    /// A paymaster cannot designate an aggregator, so any non-zero paymaster aggregator is the
    /// signature failure marker and wins over the account's aggregator.
    pub fn merge(account: &ValidationData, paymaster: &ValidationData) -> ValidationData {
        let aggregator = if paymaster.aggregator.is_zero() {
            account.aggregator
        } else {
            SIG_VALIDATION_FAILED
        };

        ValidationData {
            aggregator,
            valid_after: account.valid_after.max(paymaster.valid_after),
            valid_until: account.valid_until.min(paymaster.valid_until),
        }
    }
}

/// Decodes and merges the two words returned by a simulation.
pub fn merge_validation_data_values(account: U256, paymaster: U256) -> ValidationData {
    ValidationData::merge(
        &parse_validation_data(account),
        &parse_validation_data(paymaster),
    )
}

fn read_uint48(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[2..].copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}
