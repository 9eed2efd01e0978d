//! Rate functions
//!
//! A rate function turns (unit price, quantity) into a cost. Metric
//! configuration selects one per metric by tag:
//!
//! ```json
//! { "type": "linear" }
//! { "type": "flat" }
//! { "type": "tiered", "tiers": [{ "up_to": "100", "factor": "1" }, { "factor": "0.5" }] }
//! { "type": "named", "name": "storage-gb-hours" }
//! ```
//!
//! `named` functions are looked up in a [`RateFunctionRegistry`] populated at
//! startup; there is no runtime code loading.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tally_common::{Result, TallyError};

/// Pure mapping from (unit price, quantity) to cost.
///
/// A cost outside the `Decimal` range is a `Validation` error, never a panic.
pub trait RateFunction: Send + Sync {
    fn rate(&self, price: Decimal, quantity: Decimal) -> Result<Decimal>;
}

impl<F> RateFunction for F
where
    F: Fn(Decimal, Decimal) -> Result<Decimal> + Send + Sync,
{
    fn rate(&self, price: Decimal, quantity: Decimal) -> Result<Decimal> {
        self(price, quantity)
    }
}

fn overflow(price: Decimal, quantity: Decimal) -> TallyError {
    TallyError::Validation(format!(
        "cost of quantity {} at price {} is out of range",
        quantity, price
    ))
}

/// `price * quantity`
#[derive(Debug, Clone, Copy, Default)]
pub struct Linear;

impl RateFunction for Linear {
    fn rate(&self, price: Decimal, quantity: Decimal) -> Result<Decimal> {
        price
            .checked_mul(quantity)
            .ok_or_else(|| overflow(price, quantity))
    }
}

/// `price` once any usage is reported, zero otherwise
#[derive(Debug, Clone, Copy, Default)]
pub struct Flat;

impl RateFunction for Flat {
    fn rate(&self, price: Decimal, quantity: Decimal) -> Result<Decimal> {
        Ok(if quantity > Decimal::ZERO {
            price
        } else {
            Decimal::ZERO
        })
    }
}

/// One quantity band of a tiered rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Inclusive upper bound of the band; `None` for the open-ended last band
    #[serde(default)]
    pub up_to: Option<Decimal>,
    /// Multiplier applied to the unit price within the band
    pub factor: Decimal,
}

/// Volume bands, each charged at `price * factor`
#[derive(Debug, Clone, PartialEq)]
pub struct Tiered {
    tiers: Vec<Tier>,
}

impl Tiered {
    pub fn new(tiers: Vec<Tier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(TallyError::Config("tiered rate needs at least one tier".into()));
        }
        let mut previous = Decimal::ZERO;
        for (i, tier) in tiers.iter().enumerate() {
            match tier.up_to {
                Some(bound) if bound <= previous => {
                    return Err(TallyError::Config(format!(
                        "tier bounds must increase, got {} after {}",
                        bound, previous
                    )));
                }
                Some(bound) => previous = bound,
                None if i + 1 != tiers.len() => {
                    return Err(TallyError::Config(
                        "only the last tier may be open-ended".into(),
                    ));
                }
                None => {}
            }
        }
        Ok(Self { tiers })
    }
}

impl RateFunction for Tiered {
    fn rate(&self, price: Decimal, quantity: Decimal) -> Result<Decimal> {
        let band = |cost: Decimal, width: Decimal, factor: Decimal| {
            width
                .checked_mul(price)
                .and_then(|c| c.checked_mul(factor))
                .and_then(|c| cost.checked_add(c))
                .ok_or_else(|| overflow(price, quantity))
        };

        let mut cost = Decimal::ZERO;
        let mut lower = Decimal::ZERO;
        let mut last_factor = Decimal::ZERO;

        for tier in &self.tiers {
            last_factor = tier.factor;
            let upper = match tier.up_to {
                Some(bound) => bound.min(quantity),
                None => quantity,
            };
            if upper > lower {
                cost = band(cost, upper - lower, tier.factor)?;
            }
            lower = tier.up_to.unwrap_or(quantity).max(lower);
            if lower >= quantity {
                return Ok(cost);
            }
        }

        // Quantity beyond the last bounded tier is charged at its factor
        if quantity > lower {
            cost = band(cost, quantity - lower, last_factor)?;
        }
        Ok(cost)
    }
}

/// Rate function selector as found in metric configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateSpec {
    Linear,
    Flat,
    Tiered { tiers: Vec<Tier> },
    Named { name: String },
}

impl Default for RateSpec {
    fn default() -> Self {
        RateSpec::Linear
    }
}

/// Named rate functions available to metric configuration
#[derive(Clone, Default)]
pub struct RateFunctionRegistry {
    functions: HashMap<String, Arc<dyn RateFunction>>,
}

impl RateFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under a name, replacing any previous one
    pub fn register(mut self, name: impl Into<String>, function: impl RateFunction + 'static) -> Self {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RateFunction>> {
        self.functions.get(name).cloned()
    }

    /// Build the function a configuration entry selects
    pub fn build(&self, spec: &RateSpec) -> Result<Arc<dyn RateFunction>> {
        Ok(match spec {
            RateSpec::Linear => Arc::new(Linear),
            RateSpec::Flat => Arc::new(Flat),
            RateSpec::Tiered { tiers } => Arc::new(Tiered::new(tiers.clone())?),
            RateSpec::Named { name } => self.get(name).ok_or_else(|| {
                TallyError::Config(format!("rate function {:?} is not registered", name))
            })?,
        })
    }
}

impl fmt::Debug for RateFunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateFunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tier(up_to: Option<Decimal>, factor: Decimal) -> Tier {
        Tier { up_to, factor }
    }

    #[test]
    fn test_linear() {
        assert_eq!(Linear.rate(dec!(0.5), dec!(10)).unwrap(), dec!(5.0));
        assert_eq!(Linear.rate(dec!(0.5), dec!(4)).unwrap(), dec!(2.0));
        assert_eq!(Linear.rate(Decimal::ZERO, dec!(1000)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_flat() {
        assert_eq!(Flat.rate(dec!(9.99), dec!(3)).unwrap(), dec!(9.99));
        assert_eq!(Flat.rate(dec!(9.99), Decimal::ZERO).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_tiered_bands() {
        let tiered = Tiered::new(vec![
            tier(Some(dec!(100)), dec!(1)),
            tier(Some(dec!(1000)), dec!(0.5)),
            tier(None, dec!(0.25)),
        ])
        .unwrap();

        assert_eq!(tiered.rate(dec!(2), dec!(50)).unwrap(), dec!(100));
        // 100 * 2 + 100 * 2 * 0.5
        assert_eq!(tiered.rate(dec!(2), dec!(200)).unwrap(), dec!(300));
        // 100 * 2 + 900 * 2 * 0.5 + 1000 * 2 * 0.25
        assert_eq!(tiered.rate(dec!(2), dec!(2000)).unwrap(), dec!(1600));
    }

    #[test]
    fn test_tiered_without_open_band_uses_last_factor() {
        let tiered = Tiered::new(vec![
            tier(Some(dec!(10)), dec!(1)),
            tier(Some(dec!(20)), dec!(0.5)),
        ])
        .unwrap();
        // 10 * 1 + 10 * 0.5 + 5 * 0.5
        assert_eq!(tiered.rate(dec!(1), dec!(25)).unwrap(), dec!(17.5));
    }

    #[test]
    fn test_overflowing_cost_is_an_error() {
        assert!(matches!(
            Linear.rate(dec!(2), Decimal::MAX),
            Err(TallyError::Validation(_))
        ));
        assert_eq!(Flat.rate(dec!(2), Decimal::MAX).unwrap(), dec!(2));

        let tiered = Tiered::new(vec![
            tier(Some(dec!(10)), dec!(1)),
            tier(None, dec!(3)),
        ])
        .unwrap();
        assert!(matches!(
            tiered.rate(dec!(1), Decimal::MAX),
            Err(TallyError::Validation(_))
        ));
    }

    #[test]
    fn test_tiered_rejects_bad_bounds() {
        assert!(Tiered::new(vec![]).is_err());
        assert!(Tiered::new(vec![tier(Some(dec!(10)), dec!(1)), tier(Some(dec!(5)), dec!(1))]).is_err());
        assert!(Tiered::new(vec![tier(None, dec!(1)), tier(Some(dec!(5)), dec!(1))]).is_err());
    }

    #[test]
    fn test_spec_deserializes_from_tags() {
        let spec: RateSpec = serde_json::from_str(r#"{"type":"linear"}"#).unwrap();
        assert_eq!(spec, RateSpec::Linear);

        let spec: RateSpec = serde_json::from_str(
            r#"{"type":"tiered","tiers":[{"up_to":"100","factor":"1"},{"factor":"0.5"}]}"#,
        )
        .unwrap();
        assert!(matches!(spec, RateSpec::Tiered { ref tiers } if tiers.len() == 2));
    }

    #[test]
    fn test_registry_resolves_named_functions() {
        let double = |p: Decimal, q: Decimal| -> Result<Decimal> { Ok(p * q * dec!(2)) };
        let registry = RateFunctionRegistry::new().register("double", double);

        let function = registry
            .build(&RateSpec::Named { name: "double".into() })
            .unwrap();
        assert_eq!(function.rate(dec!(0.5), dec!(10)).unwrap(), dec!(10.0));

        let missing = registry.build(&RateSpec::Named { name: "triple".into() });
        assert!(matches!(missing, Err(TallyError::Config(_))));
    }
}
