use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::QuantityError;

const SCALE: i128 = 1_000_000;
const DECIMALS: usize = 6;

/// Trade quantity held as an integer count of millionths, so sums are exact
/// and independent of the order partials are merged in. Serializes as a
/// decimal string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(i128);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    /// Rounds to the nearest millionth. Non-finite input saturates.
    pub fn from_f64(v: f64) -> Self {
        Quantity((v * SCALE as f64).round() as i128)
    }

    pub fn from_micros(micros: i128) -> Self { Quantity(micros) }

    pub fn micros(self) -> i128 { self.0 }

    pub fn to_f64(self) -> f64 {
        (self.0 / SCALE) as f64 + (self.0 % SCALE) as f64 / SCALE as f64
    }

    pub fn is_zero(self) -> bool { self.0 == 0 }
}

impl Add for Quantity {
    type Output = Quantity;
    fn add(self, rhs: Quantity) -> Quantity { Quantity(self.0.saturating_add(rhs.0)) }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) { *self = *self + rhs; }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity { iter.fold(Quantity::ZERO, Add::add) }
}

impl<'a> Sum<&'a Quantity> for Quantity {
    fn sum<I: Iterator<Item = &'a Quantity>>(iter: I) -> Quantity { iter.copied().sum() }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let (whole, frac) = (abs / SCALE as u128, abs % SCALE as u128);
        if frac == 0 {
            return write!(f, "{}{}", sign, whole);
        }
        let digits = format!("{:0width$}", frac, width = DECIMALS);
        write!(f, "{}{}.{}", sign, whole, digits.trim_end_matches('0'))
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syntax = || QuantityError::Syntax(s.to_string());
        let t = s.trim();
        let (negative, body) = match t.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, t.strip_prefix('+').unwrap_or(t)),
        };
        let (whole, frac) = body.split_once('.').unwrap_or((body, ""));
        if whole.is_empty() && frac.is_empty() { return Err(syntax()); }
        if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) { return Err(syntax()); }
        if frac.len() > DECIMALS { return Err(QuantityError::Precision(s.to_string())); }

        let overflow = || QuantityError::Overflow(s.to_string());
        let w: i128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| overflow())? };
        let f: i128 = if frac.is_empty() { 0 } else { format!("{:0<width$}", frac, width = DECIMALS).parse().map_err(|_| syntax())? };
        let micros = w.checked_mul(SCALE).and_then(|m| m.checked_add(f)).ok_or_else(overflow)?;
        Ok(Quantity(if negative { -micros } else { micros }))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct QuantityVisitor;

impl<'de> Visitor<'de> for QuantityVisitor {
    type Value = Quantity;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal quantity")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> { v.parse().map_err(E::custom) }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> { Ok(Quantity(v as i128 * SCALE)) }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> { Ok(Quantity(v as i128 * SCALE)) }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Quantity, E> { Ok(Quantity::from_f64(v)) }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(QuantityVisitor)
    }
}
