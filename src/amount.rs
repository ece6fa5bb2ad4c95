//! Money and share-count helpers

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Round a money value to cents, half away from zero
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Parse a broker-style numeric string ("187.23", "  12 ") into a Decimal
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

/// Lenient decimal extraction from provider JSON (number or numeric string)
pub fn decimal_from_value(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => parse_decimal(&n.to_string()),
        serde_json::Value::String(s) => parse_decimal(s),
        _ => None,
    }
}

/// Lenient f64 extraction from provider JSON (number or numeric string)
pub fn f64_from_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// Whole shares from a broker quantity string; fractional remainders are dropped
pub fn whole_shares(raw: Decimal) -> u64 {
    if raw <= Decimal::ZERO {
        return 0;
    }
    raw.floor().to_u64().unwrap_or(0)
}

/// Largest whole-share count purchasable with `budget` at `price`
pub fn shares_for_budget(budget: Decimal, price: Decimal) -> u64 {
    if price <= Decimal::ZERO || budget <= Decimal::ZERO {
        return 0;
    }
    whole_shares(budget / price)
}

/// Day change in percent, rounded to two places
pub fn day_change_pct(price: Decimal, last_close: Decimal) -> Option<f64> {
    if last_close <= Decimal::ZERO {
        return None;
    }
    let pct = round2((price - last_close) / last_close * Decimal::from(100));
    pct.to_f64()
}

pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

pub fn from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Round then clamp an integer-valued knob, falling back when the input is unusable
pub fn clamp_round(raw: Option<f64>, min: i64, max: i64, fallback: i64) -> i64 {
    match raw {
        Some(v) if v.is_finite() => (v.round() as i64).clamp(min, max),
        _ => fallback,
    }
}

/// Trim text and cap its length, appending "..." when cut
pub fn truncate_text(raw: &str, max_len: usize) -> String {
    let text = raw.trim();
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let keep = max_len.saturating_sub(1);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round2_half_away_from_zero() {
        assert_eq!(round2(Decimal::new(10005, 3)), Decimal::new(1001, 2));
        assert_eq!(round2(Decimal::new(-10005, 3)), Decimal::new(-1001, 2));
    }

    #[test]
    fn test_parse_broker_strings() {
        assert_eq!(parse_decimal("187.23"), Some(Decimal::new(18723, 2)));
        assert_eq!(parse_decimal(" 12 "), Some(Decimal::from(12)));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("abc"), None);
    }

    #[test]
    fn test_shares_for_budget() {
        assert_eq!(shares_for_budget(Decimal::from(1000), Decimal::new(19235, 2)), 5);
        assert_eq!(shares_for_budget(Decimal::ZERO, Decimal::from(10)), 0);
        assert_eq!(shares_for_budget(Decimal::from(10), Decimal::ZERO), 0);
        assert_eq!(shares_for_budget(Decimal::from(99), Decimal::from(100)), 0);
    }

    #[test]
    fn test_day_change_pct() {
        assert_eq!(day_change_pct(Decimal::from(110), Decimal::from(100)), Some(10.0));
        assert_eq!(day_change_pct(Decimal::from(110), Decimal::ZERO), None);
    }

    #[test]
    fn test_clamp_round() {
        assert_eq!(clamp_round(Some(300.0), 5, 240, 30), 240);
        assert_eq!(clamp_round(Some(7.6), 5, 240, 30), 8);
        assert_eq!(clamp_round(None, 5, 240, 30), 30);
        assert_eq!(clamp_round(Some(f64::NAN), 5, 240, 30), 30);
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("  short  ", 10), "short");
        assert_eq!(truncate_text("abcdefghij", 5), "abcd...");
    }
}
