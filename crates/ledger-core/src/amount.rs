//! Fixed-point monetary amounts.
//!
//! Amounts are stored as a signed count of 10^-8 units, matching a
//! `DECIMAL(18,8)` column. On the wire and in digests they are rendered as a
//! plain decimal string with trailing fractional zeros trimmed (`"100"`,
//! `"12.5"`), so the textual form is canonical.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;
use thiserror::Error;

use crate::constants::{AMOUNT_DECIMALS, AMOUNT_SCALE};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount `{0}`")]
    Invalid(String),
    #[error("amount `{0}` has more than 8 fractional digits")]
    TooPrecise(String),
    #[error("amount `{0}` is out of range")]
    Overflow(String),
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Build from raw 10^-8 units.
    pub const fn from_units(units: i64) -> Self {
        Amount(units)
    }

    /// Build from a whole number of currency units.
    pub fn whole(value: i64) -> Option<Self> {
        value.checked_mul(AMOUNT_SCALE).map(Amount)
    }

    pub const fn units(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = AMOUNT_SCALE as u64;
        let int = abs / scale;
        let frac = abs % scale;
        if frac == 0 {
            return write!(f, "{sign}{int}");
        }
        let digits = format!("{frac:0width$}", width = AMOUNT_DECIMALS);
        write!(f, "{sign}{int}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::Invalid(s.to_string()));
        }
        let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(int_part) || !all_digits(frac_part) {
            return Err(AmountError::Invalid(s.to_string()));
        }
        if frac_part.len() > AMOUNT_DECIMALS {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let overflow = || AmountError::Overflow(s.to_string());
        let int: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| overflow())?
        };
        let mut frac: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| overflow())?
        };
        for _ in frac_part.len()..AMOUNT_DECIMALS {
            frac *= 10;
        }
        let units = int
            .checked_mul(AMOUNT_SCALE)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(overflow)?;
        Ok(Amount(if negative { -units } else { units }))
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct AmountVisitor;

impl Visitor<'_> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal amount as a string or number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        Amount::whole(v).ok_or_else(|| E::custom(AmountError::Overflow(v.to_string())))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        i64::try_from(v)
            .ok()
            .and_then(Amount::whole)
            .ok_or_else(|| E::custom(AmountError::Overflow(v.to_string())))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
        format!("{v:.prec$}", prec = AMOUNT_DECIMALS)
            .parse()
            .map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // bincode cannot drive `deserialize_any`
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(AmountVisitor)
        } else {
            deserializer.deserialize_str(AmountVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_are_canonical() {
        let cases = [
            ("100", "100"),
            ("100.00000000", "100"),
            ("12.50", "12.5"),
            ("0.00000001", "0.00000001"),
            ("-3.25", "-3.25"),
            (".5", "0.5"),
            ("+7", "7"),
        ];
        for (input, expected) in cases {
            let amount: Amount = input.parse().unwrap();
            assert_eq!(amount.to_string(), expected, "input {input}");
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("".parse::<Amount>(), Err(AmountError::Empty));
        assert!(matches!("1.2.3".parse::<Amount>(), Err(AmountError::Invalid(_))));
        assert!(matches!("abc".parse::<Amount>(), Err(AmountError::Invalid(_))));
        assert!(matches!(".".parse::<Amount>(), Err(AmountError::Invalid(_))));
        assert!(matches!(
            "1.123456789".parse::<Amount>(),
            Err(AmountError::TooPrecise(_))
        ));
        assert!(matches!(
            "999999999999999999999".parse::<Amount>(),
            Err(AmountError::Overflow(_))
        ));
    }

    #[test]
    fn json_accepts_strings_and_numbers() {
        let a: Amount = serde_json::from_str("\"10.5\"").unwrap();
        let b: Amount = serde_json::from_str("10.5").unwrap();
        let c: Amount = serde_json::from_str("10").unwrap();
        assert_eq!(a, b);
        assert_eq!(c, Amount::whole(10).unwrap());
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"10.5\"");
    }

    #[test]
    fn bincode_roundtrip() {
        let amount: Amount = "42.125".parse().unwrap();
        let bytes = bincode::serialize(&amount).unwrap();
        let back: Amount = bincode::deserialize(&bytes).unwrap();
        assert_eq!(amount, back);
    }

    #[test]
    fn sums() {
        let total: Amount = ["1.5", "2.25", "-0.75"]
            .iter()
            .map(|s| s.parse::<Amount>().unwrap())
            .sum();
        assert_eq!(total.to_string(), "3");
    }
}
