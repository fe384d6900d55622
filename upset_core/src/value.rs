//! Register values as they are held in checkpoint attribute stores, plus the
//! single-bit flip primitive every injection goes through.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Widest register the flip primitive can address.
pub const MAX_REGISTER_BITS: u32 = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("Invalid numeric literal {0:?}")]
    InvalidLiteral(String),

    #[error("Invalid bit {bit} for a {num_bits}-bit register")]
    InvalidBit { bit: u32, num_bits: u32 },

    #[error("Index {index:?} does not address a scalar element")]
    InvalidIndex { index: Vec<usize> },
}

/// A register value: a scalar or a nested list of values, mirroring how
/// multi-dimensional register arrays are stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(untagged)]
pub enum Value {
    Scalar(u64),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<u64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Array(_) => None,
        }
    }

    /// Follows `index` down through nested arrays. An empty index addresses
    /// the value itself.
    pub fn get(&self, index: &[usize]) -> Option<&Value> {
        match index.split_first() {
            None => Some(self),
            Some((head, rest)) => match self {
                Value::Array(items) => items.get(*head)?.get(rest),
                Value::Scalar(_) => None,
            },
        }
    }

    /// Reads the scalar leaf at `index`.
    pub fn leaf(&self, index: &[usize]) -> Result<u64, ValueError> {
        self.get(index)
            .and_then(Value::as_scalar)
            .ok_or_else(|| ValueError::InvalidIndex {
                index: index.to_vec(),
            })
    }

    /// Replaces only the scalar leaf at `index`, leaving every sibling
    /// element untouched. Returns the previous leaf value.
    pub fn replace_leaf(&mut self, index: &[usize], new_value: u64) -> Result<u64, ValueError> {
        let slot = Self::leaf_slot(self, index).ok_or_else(|| ValueError::InvalidIndex {
            index: index.to_vec(),
        })?;
        match slot {
            Value::Scalar(old) => {
                let previous = *old;
                *old = new_value;
                Ok(previous)
            }
            Value::Array(_) => Err(ValueError::InvalidIndex {
                index: index.to_vec(),
            }),
        }
    }

    fn leaf_slot<'a>(value: &'a mut Value, index: &[usize]) -> Option<&'a mut Value> {
        match index.split_first() {
            None => Some(value),
            Some((head, rest)) => match value {
                Value::Array(items) => Self::leaf_slot(items.get_mut(*head)?, rest),
                Value::Scalar(_) => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(v) => write!(f, "{}", format_hex(*v)),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Parses an integer literal with C-style prefixes: `0x`, `0b`, `0o`, a
/// leading `0` for octal, otherwise decimal. Integer suffixes (`u`, `l`)
/// are ignored.
pub fn parse_literal(literal: &str) -> Result<u64, ValueError> {
    let invalid = || ValueError::InvalidLiteral(literal.to_string());
    let trimmed = literal
        .trim()
        .trim_end_matches(['u', 'U', 'l', 'L'])
        .replace('_', "");
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let lower = trimmed.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (&lower[1..], 8)
    } else {
        (lower.as_str(), 10)
    };
    if digits.is_empty() {
        return Err(invalid());
    }
    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}

pub fn format_hex(value: u64) -> String {
    format!("{value:#x}")
}

/// Flips `bit` of `value`, treating it as a `num_bits`-wide register.
pub fn flip_scalar(value: u64, num_bits: u32, bit: u32) -> Result<u64, ValueError> {
    if num_bits == 0 || num_bits > MAX_REGISTER_BITS || bit >= num_bits {
        return Err(ValueError::InvalidBit { bit, num_bits });
    }
    Ok(value ^ (1u64 << bit))
}

/// Parses `value` as an integer literal, flips `bit` and renders the result
/// as a hexadecimal literal.
pub fn flip_bit(value: &str, num_bits: u32, bit: u32) -> Result<String, ValueError> {
    let parsed = parse_literal(value)?;
    flip_scalar(parsed, num_bits, bit).map(format_hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_literal_accepts_c_style_prefixes() {
        assert_eq!(parse_literal("0x1F").unwrap(), 31);
        assert_eq!(parse_literal("0b101").unwrap(), 5);
        assert_eq!(parse_literal("017").unwrap(), 15);
        assert_eq!(parse_literal("0o17").unwrap(), 15);
        assert_eq!(parse_literal("42").unwrap(), 42);
        assert_eq!(parse_literal("0").unwrap(), 0);
        assert_eq!(parse_literal(" 0xffUL ").unwrap(), 255);
    }

    #[test]
    fn parse_literal_rejects_garbage() {
        for bad in ["", "0x", "zz", "09", "-1"] {
            assert!(
                matches!(parse_literal(bad), Err(ValueError::InvalidLiteral(_))),
                "Expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn flip_bit_flips_exactly_one_bit() {
        assert_eq!(flip_bit("0x0", 32, 0).unwrap(), "0x1");
        assert_eq!(flip_bit("0xff", 32, 7).unwrap(), "0x7f");
        assert_eq!(flip_bit("0", 64, 63).unwrap(), "0x8000000000000000");
    }

    #[test]
    fn flip_bit_rejects_out_of_range_bit() {
        match flip_bit("0x1", 8, 8) {
            Err(ValueError::InvalidBit { bit, num_bits }) => {
                assert_eq!((bit, num_bits), (8, 8));
            }
            other => panic!("Expected InvalidBit, got {other:?}"),
        }
        assert!(flip_bit("0x1", 65, 3).is_err());
    }

    #[test]
    fn replace_leaf_leaves_siblings_untouched() {
        let mut value = Value::Array(vec![
            Value::Array(vec![Value::Scalar(1), Value::Scalar(2)]),
            Value::Array(vec![Value::Scalar(3), Value::Scalar(4)]),
        ]);
        let previous = value.replace_leaf(&[1, 0], 0x30).unwrap();
        assert_eq!(previous, 3);
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Array(vec![Value::Scalar(1), Value::Scalar(2)]),
                Value::Array(vec![Value::Scalar(0x30), Value::Scalar(4)]),
            ])
        );
        assert!(value.replace_leaf(&[1], 0).is_err(), "Non-leaf index must fail");
        assert!(value.replace_leaf(&[2, 0], 0).is_err(), "Out of range must fail");
    }

    #[test]
    fn display_renders_nested_hex() {
        let value = Value::Array(vec![Value::Scalar(10), Value::Array(vec![Value::Scalar(255)])]);
        assert_eq!(value.to_string(), "[0xa, [0xff]]");
    }

    proptest! {
        #[test]
        fn flipping_twice_restores_value(value in any::<u64>(), num_bits in 1u32..=64, bit_seed in any::<u32>()) {
            let bit = bit_seed % num_bits;
            let once = flip_scalar(value, num_bits, bit).unwrap();
            prop_assert_eq!((once ^ value).count_ones(), 1);
            prop_assert_eq!(flip_scalar(once, num_bits, bit).unwrap(), value);
        }
    }
}
