use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const PODS: &str = "pods";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

const NANOS_PER_UNIT: i128 = 1_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("failed to parse quantity \"{raw}\": {reason}")]
pub struct QuantityParseError {
    raw: String,
    reason: &'static str,
}

impl QuantityParseError {
    fn new(raw: &str, reason: &'static str) -> Self {
        Self {
            raw: raw.to_string(),
            reason,
        }
    }
}

/// A Kubernetes quantity held as an exact count of nano-units.
///
/// `"500m"` is 500_000_000, `"1Ki"` is 1024 * 10^9. Anything finer than a
/// nano-unit rounds up, which is the precision Kubernetes itself keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceQuantity(i128);

impl ResourceQuantity {
    pub const ZERO: ResourceQuantity = ResourceQuantity(0);

    pub fn from_units(units: i64) -> Self {
        Self(units as i128 * NANOS_PER_UNIT)
    }

    pub fn nanos(&self) -> i128 {
        self.0
    }

    /// Whole units, rounded up.
    pub fn ceil_units(&self) -> i128 {
        self.0.div_euclid(NANOS_PER_UNIT) + i128::from(self.0.rem_euclid(NANOS_PER_UNIT) != 0)
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self((self.0 - other.0).max(0))
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// `percent` of this quantity, rounded up to the next nano.
    pub fn percent(self, percent: ResourceQuantity) -> Self {
        let scaled = self.0.saturating_mul(percent.0);
        let divisor = 100 * NANOS_PER_UNIT;
        Self(scaled.div_euclid(divisor) + i128::from(scaled.rem_euclid(divisor) != 0))
    }
}

enum Scale {
    Decimal(i32),
    Binary(u32),
}

fn suffix_scale(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(1),
        "Mi" => Scale::Binary(2),
        "Gi" => Scale::Binary(3),
        "Ti" => Scale::Binary(4),
        "Pi" => Scale::Binary(5),
        "Ei" => Scale::Binary(6),
        _ => {
            let exponent = suffix.strip_prefix(['e', 'E'])?;
            Scale::Decimal(exponent.parse().ok()?)
        }
    };
    Some(scale)
}

impl FromStr for ResourceQuantity {
    type Err = QuantityParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        let (negative, unsigned) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };

        let split = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(split);
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(QuantityParseError::new(raw, "missing number"));
        }
        if fraction.contains('.') {
            return Err(QuantityParseError::new(raw, "more than one decimal point"));
        }
        let scale = suffix_scale(suffix).ok_or(QuantityParseError::new(raw, "unknown suffix"))?;

        let digits = format!("{whole}{fraction}");
        let overflow = || QuantityParseError::new(raw, "value out of range");
        let mut value: i128 = digits.parse().map_err(|_| overflow())?;
        let mut exponent = i32::try_from(fraction.len())
            .ok()
            .and_then(|len| 9_i32.checked_sub(len))
            .ok_or_else(overflow)?;
        match scale {
            Scale::Decimal(e) => exponent = exponent.checked_add(e).ok_or_else(overflow)?,
            Scale::Binary(power) => {
                value = value
                    .checked_mul(1024_i128.pow(power))
                    .ok_or_else(overflow)?;
            }
        }

        if exponent >= 0 {
            let factor = 10_i128.checked_pow(exponent as u32).ok_or_else(overflow)?;
            value = value.checked_mul(factor).ok_or_else(overflow)?;
        } else {
            value = match 10_i128.checked_pow(exponent.unsigned_abs()) {
                Some(divisor) => value / divisor + i128::from(value % divisor != 0),
                None => i128::from(value != 0),
            };
        }

        Ok(Self(if negative { -value } else { value }))
    }
}

impl fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % NANOS_PER_UNIT == 0 {
            write!(f, "{}", self.0 / NANOS_PER_UNIT)
        } else if self.0 % 1_000_000 == 0 {
            write!(f, "{}m", self.0 / 1_000_000)
        } else {
            write!(f, "{}n", self.0)
        }
    }
}

impl TryFrom<&Quantity> for ResourceQuantity {
    type Error = QuantityParseError;

    fn try_from(q: &Quantity) -> Result<Self, Self::Error> {
        q.0.parse()
    }
}

/// A named resource vector, e.g. `{cpu: 2, memory: 4Gi}`.
/// Dimensions that are absent read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources(BTreeMap<String, ResourceQuantity>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_quantities(
        quantities: &BTreeMap<String, Quantity>,
    ) -> Result<Resources, QuantityParseError> {
        quantities
            .iter()
            .map(|(name, q)| -> Result<_, QuantityParseError> {
                Ok((name.clone(), ResourceQuantity::try_from(q)?))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Resources)
    }

    pub fn to_quantities(&self) -> BTreeMap<String, Quantity> {
        self.0
            .iter()
            .map(|(name, q)| (name.clone(), Quantity(q.to_string())))
            .collect()
    }

    pub fn with(mut self, name: impl Into<String>, quantity: ResourceQuantity) -> Self {
        self.insert(name, quantity);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, quantity: ResourceQuantity) {
        self.0.insert(name.into(), quantity);
    }

    pub fn get(&self, name: &str) -> ResourceQuantity {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceQuantity)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of both vectors, dimension by dimension.
    pub fn merge(&self, other: &Resources) -> Resources {
        let mut merged = self.clone();
        for (name, q) in other.iter() {
            let current = merged.get(name);
            merged.insert(name.clone(), current.saturating_add(*q));
        }
        merged
    }

    /// Subtract `other`, flooring each of our dimensions at zero.
    /// Dimensions only present in `other` are ignored.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources(
            self.0
                .iter()
                .map(|(name, q)| (name.clone(), q.saturating_sub(other.get(name))))
                .collect(),
        )
    }
}

impl FromIterator<(String, ResourceQuantity)> for Resources {
    fn from_iter<T: IntoIterator<Item = (String, ResourceQuantity)>>(iter: T) -> Self {
        Resources(iter.into_iter().collect())
    }
}

/// Whether `allocatable` covers every dimension present in `requested`.
pub fn fits(requested: &Resources, allocatable: &Resources) -> bool {
    requested
        .iter()
        .all(|(name, quantity)| allocatable.get(name) >= *quantity)
}
