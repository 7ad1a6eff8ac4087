//! Credit and expiry calculation
//!
//! Everything here is pure. Callers pass `now` so results are reproducible.

use time::{Date, Duration, Month, OffsetDateTime};

use crate::config::OfferBonus;
use crate::models::PlanType;

/// A yearly expiry closer than this to the subscription start is treated as a
/// monthly period end reported against a yearly plan.
const YEARLY_SANITY_DAYS: i64 = 183;

#[derive(Debug, Clone, Copy, Default)]
pub struct CreditCalculator {
    bonus: OfferBonus,
}

impl CreditCalculator {
    pub fn new(bonus: OfferBonus) -> Self {
        Self { bonus }
    }

    /// Credits granted for `base`, with the offer bonus when the user holds one
    pub fn compute_credits(&self, base: i64, has_offer: bool) -> i64 {
        if !has_offer {
            return base;
        }
        base.saturating_add(base.saturating_mul(self.bonus.percent) / 100)
            .saturating_add(self.bonus.flat)
    }
}

/// Provider period end when known, otherwise one calendar month or year from `now`.
/// One-time purchases never expire.
pub fn compute_expiry(
    plan_type: PlanType,
    provider_period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    match plan_type {
        PlanType::OneTime => None,
        PlanType::Monthly => Some(provider_period_end.unwrap_or_else(|| add_months(now, 1))),
        PlanType::Yearly => Some(provider_period_end.unwrap_or_else(|| add_months(now, 12))),
    }
}

/// Repair a yearly expiry that lands less than half a year after `started_at`
pub fn correct_yearly_expiry(
    plan_type: PlanType,
    expiry: OffsetDateTime,
    started_at: OffsetDateTime,
) -> OffsetDateTime {
    if plan_type == PlanType::Yearly && expiry < started_at + Duration::days(YEARLY_SANITY_DAYS) {
        let corrected = add_months(started_at, 12);
        tracing::warn!(
            reported = %expiry,
            corrected = %corrected,
            "Yearly expiry too close to subscription start, correcting"
        );
        corrected
    } else {
        expiry
    }
}

/// Calendar month arithmetic, clamping the day to the target month's length
pub fn add_months(at: OffsetDateTime, months: u32) -> OffsetDateTime {
    let date = at.date();
    let zero_based = i64::from(u8::from(date.month())) - 1 + i64::from(months);
    let year = date.year() + (zero_based / 12) as i32;
    let target = u8::try_from(zero_based % 12 + 1)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .and_then(|month| {
            let day = date.day().min(time::util::days_in_year_month(year, month));
            Date::from_calendar_date(year, month, day).ok()
        });

    match target {
        Some(new_date) => at.replace_date(new_date),
        None => at + Duration::days(30 * i64::from(months)),
    }
}
