//! Reconciliation settings

use std::env;

use crate::error::{BillingError, BillingResult};

/// Bonus applied once to a purchase when the user holds a pending offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferBonus {
    /// Percentage of the base credits added on top
    pub percent: i64,
    /// Flat credits added on top
    pub flat: i64,
}

impl Default for OfferBonus {
    fn default() -> Self {
        Self {
            percent: 20,
            flat: 0,
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub offer_bonus: OfferBonus,
    /// Trailing window for the recent-grant idempotency and resolver fallbacks
    pub correlation_window: time::Duration,
    /// Conditional update attempts before giving up with `ConcurrentModification`
    pub grant_update_max_attempts: u32,
    /// Age after which a delivery stuck in `processing` may be reclaimed
    pub delivery_stuck_after: std::time::Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            offer_bonus: OfferBonus::default(),
            correlation_window: time::Duration::minutes(5),
            grant_update_max_attempts: 3,
            delivery_stuck_after: std::time::Duration::from_secs(30 * 60),
        }
    }
}

impl ReconcileConfig {
    /// Load from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BillingResult<Self> {
        let defaults = Self::default();

        let percent = parse_or(&lookup, "OFFER_BONUS_PERCENT", defaults.offer_bonus.percent)?;
        let flat = parse_or(&lookup, "OFFER_BONUS_CREDITS", defaults.offer_bonus.flat)?;
        if percent < 0 || flat < 0 {
            return Err(BillingError::Config(
                "offer bonus must not be negative".to_string(),
            ));
        }

        let window_secs = parse_or(
            &lookup,
            "CORRELATION_WINDOW_SECS",
            defaults.correlation_window.whole_seconds(),
        )?;
        if window_secs <= 0 {
            return Err(BillingError::Config(
                "CORRELATION_WINDOW_SECS must be positive".to_string(),
            ));
        }

        let attempts = parse_or(
            &lookup,
            "GRANT_UPDATE_MAX_ATTEMPTS",
            defaults.grant_update_max_attempts,
        )?;

        Ok(Self {
            offer_bonus: OfferBonus { percent, flat },
            correlation_window: time::Duration::seconds(window_secs),
            grant_update_max_attempts: attempts.max(1),
            delivery_stuck_after: defaults.delivery_stuck_after,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> BillingResult<T>
where
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} is not a valid number: '{}'", key, raw))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ReconcileConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.offer_bonus, OfferBonus { percent: 20, flat: 0 });
        assert_eq!(config.correlation_window, time::Duration::minutes(5));
        assert_eq!(config.grant_update_max_attempts, 3);
    }

    #[test]
    fn test_overrides() {
        let config = ReconcileConfig::from_lookup(lookup(&[
            ("OFFER_BONUS_PERCENT", "50"),
            ("OFFER_BONUS_CREDITS", "10"),
            ("CORRELATION_WINDOW_SECS", "60"),
            ("GRANT_UPDATE_MAX_ATTEMPTS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.offer_bonus, OfferBonus { percent: 50, flat: 10 });
        assert_eq!(config.correlation_window, time::Duration::seconds(60));
        assert_eq!(config.grant_update_max_attempts, 1);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            ReconcileConfig::from_lookup(lookup(&[("OFFER_BONUS_PERCENT", "lots")])),
            Err(BillingError::Config(_))
        ));
        assert!(ReconcileConfig::from_lookup(lookup(&[("CORRELATION_WINDOW_SECS", "0")])).is_err());
    }
}
