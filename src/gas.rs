// src/gas.rs
use ethers::abi::{self, Token, Tokenizable};
use ethers::types::{Bytes, U256};

use crate::types::UserOperation;

const DUMMY_SIGNATURE_LEN: usize = 65;

/// Gas overheads for user operations
/// used in calculating the pre-verification gas
#[derive(Clone, Copy, Debug)]
struct GasOverheads {
    fixed: U256,
    per_user_op: U256,
    per_user_op_word: U256,
    zero_byte: U256,
    non_zero_byte: U256,
    bundle_size: U256,
}

impl Default for GasOverheads {
    fn default() -> Self {
        Self {
            fixed: 21000.into(),
            per_user_op: 18300.into(),
            per_user_op_word: 4.into(),
            zero_byte: 4.into(),
            non_zero_byte: 16.into(),
            bundle_size: 1.into(),
        }
    }
}

/// Calldata cost of submitting `op` in a bundle, amortised over the bundle size.
///
/// An empty signature is priced as a 65-byte ECDSA signature so that estimates made before
/// signing still cover the signed operation.
pub fn calc_pre_verification_gas(op: &UserOperation) -> U256 {
    let ov = GasOverheads::default();

    let mut op = op.clone();
    if op.signature.is_empty() {
        op.signature = Bytes::from(vec![1u8; DUMMY_SIGNATURE_LEN]);
    }
    let packed = encode_fields(&op);

    let length_in_words = (packed.len() + 31) / 32;
    let call_data_cost: U256 = packed
        .iter()
        .map(|&x| {
            if x == 0 {
                ov.zero_byte
            } else {
                ov.non_zero_byte
            }
        })
        .fold(U256::zero(), |a, b| a + b);

    ov.fixed / ov.bundle_size
        + call_data_cost
        + ov.per_user_op
        + ov.per_user_op_word * length_in_words
}

// ABI encoding of the packed operation's fields as a flat parameter list.
fn encode_fields(op: &UserOperation) -> Vec<u8> {
    match op.pack().into_token() {
        Token::Tuple(fields) => abi::encode(&fields),
        token => abi::encode(&[token]),
    }
}
