//! Anomaly checks
//!
//! A registered set of typed checks over ingested metrics, each returning
//! the common [`AnomalyResult`] shape. Merchant messages never expose
//! internals; support details may reference ids and counts.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;

use super::DqSeverity;

// ============================================================================
// Result Shape
// ============================================================================

/// The registered anomaly checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyCheck {
    /// Day-over-day row count drop
    RowCountDrop,
    /// Zero ad spend after non-zero spend
    ZeroSpend,
    /// Zero orders after non-zero orders
    ZeroOrders,
    /// Missing days in a time series
    MissingDays,
    /// Negative values in must-be-positive fields
    NegativeValues,
    /// Duplicate primary keys
    DuplicatePrimaryKeys,
    /// Revenue and spend moving in opposite directions
    RevenueSpendDivergence,
}

impl AnomalyCheck {
    /// Every registered check.
    pub fn all() -> &'static [AnomalyCheck] {
        &[
            Self::RowCountDrop,
            Self::ZeroSpend,
            Self::ZeroOrders,
            Self::MissingDays,
            Self::NegativeValues,
            Self::DuplicatePrimaryKeys,
            Self::RevenueSpendDivergence,
        ]
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RowCountDrop => "row_count_drop",
            Self::ZeroSpend => "zero_spend",
            Self::ZeroOrders => "zero_orders",
            Self::MissingDays => "missing_days",
            Self::NegativeValues => "negative_values",
            Self::DuplicatePrimaryKeys => "duplicate_primary_keys",
            Self::RevenueSpendDivergence => "revenue_spend_divergence",
        }
    }
}

/// Common result of every anomaly check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    /// Which check produced this result
    pub check: AnomalyCheck,

    /// Whether an anomaly was detected
    pub is_anomaly: bool,

    /// Severity when anomalous
    pub severity: Option<DqSeverity>,

    /// Observed value
    pub observed: f64,

    /// Expected value or baseline
    pub expected: f64,

    /// Merchant-facing message; no ids, paths, or internals
    pub merchant_message: String,

    /// Support-facing detail; may reference ids and counts
    pub support_details: String,
}

impl AnomalyResult {
    fn clear(check: AnomalyCheck, observed: f64, expected: f64, support_details: String) -> Self {
        Self {
            check,
            is_anomaly: false,
            severity: None,
            observed,
            expected,
            merchant_message: String::new(),
            support_details,
        }
    }
}

// ============================================================================
// Checks
// ============================================================================

/// Day-over-day row count drop. A drop of at least `threshold_percent`
/// (default 50) is anomalous; 75% or more escalates to high.
pub fn check_row_count_drop(
    yesterday_rows: i64,
    today_rows: i64,
    threshold_percent: f64,
) -> AnomalyResult {
    let check = AnomalyCheck::RowCountDrop;
    if yesterday_rows <= 0 {
        return AnomalyResult::clear(
            check,
            today_rows as f64,
            yesterday_rows as f64,
            "no baseline rows to compare against".to_string(),
        );
    }

    let drop_percent = ((yesterday_rows - today_rows) as f64 / yesterday_rows as f64) * 100.0;
    if drop_percent < threshold_percent {
        return AnomalyResult::clear(
            check,
            today_rows as f64,
            yesterday_rows as f64,
            format!("row count within tolerance (drop {drop_percent:.1}%)"),
        );
    }

    let severity = if drop_percent >= 75.0 {
        DqSeverity::High
    } else {
        DqSeverity::Warning
    };

    AnomalyResult {
        check,
        is_anomaly: true,
        severity: Some(severity),
        observed: today_rows as f64,
        expected: yesterday_rows as f64,
        merchant_message: "We're seeing less data than usual from this source. We're looking into it."
            .to_string(),
        support_details: format!(
            "row count dropped {drop_percent:.1}% day-over-day ({yesterday_rows} -> {today_rows})"
        ),
    }
}

/// Zero ad spend after non-zero spend.
pub fn check_zero_spend(previous_spend: f64, current_spend: f64) -> AnomalyResult {
    let check = AnomalyCheck::ZeroSpend;
    if previous_spend > 0.0 && current_spend == 0.0 {
        return AnomalyResult {
            check,
            is_anomaly: true,
            severity: Some(DqSeverity::High),
            observed: current_spend,
            expected: previous_spend,
            merchant_message: "Ad spend data appears to have stopped. Check your ad account connection."
                .to_string(),
            support_details: format!(
                "spend went to zero after non-zero baseline ({previous_spend:.2} -> 0)"
            ),
        };
    }
    AnomalyResult::clear(
        check,
        current_spend,
        previous_spend,
        "spend pattern within expectations".to_string(),
    )
}

/// Zero orders after non-zero orders. Always critical: a store that
/// stops reporting orders blocks every revenue surface.
pub fn check_zero_orders(previous_orders: i64, current_orders: i64) -> AnomalyResult {
    let check = AnomalyCheck::ZeroOrders;
    if previous_orders > 0 && current_orders == 0 {
        return AnomalyResult {
            check,
            is_anomaly: true,
            severity: Some(DqSeverity::Critical),
            observed: current_orders as f64,
            expected: previous_orders as f64,
            merchant_message: "Order data appears to have stopped syncing. We're investigating."
                .to_string(),
            support_details: format!(
                "orders went to zero after non-zero baseline ({previous_orders} -> 0)"
            ),
        };
    }
    AnomalyResult::clear(
        check,
        current_orders as f64,
        previous_orders as f64,
        "order volume within expectations".to_string(),
    )
}

/// Missing days in a time series over `[start, end]` inclusive. More
/// than three missing days escalates to high.
pub fn check_missing_days(
    present_dates: &[NaiveDate],
    start: NaiveDate,
    end: NaiveDate,
) -> AnomalyResult {
    let check = AnomalyCheck::MissingDays;
    let present: HashSet<NaiveDate> = present_dates.iter().copied().collect();

    let mut missing = Vec::new();
    let mut day = start;
    while day <= end {
        if !present.contains(&day) {
            missing.push(day);
        }
        day = day.succ_opt().unwrap_or(day);
        if missing.len() > 3660 {
            break;
        }
    }

    let expected_days = (end - start).num_days() + 1;
    if missing.is_empty() {
        return AnomalyResult::clear(
            check,
            expected_days as f64,
            expected_days as f64,
            "no gaps in the series".to_string(),
        );
    }

    let severity = if missing.len() > 3 {
        DqSeverity::High
    } else {
        DqSeverity::Warning
    };

    AnomalyResult {
        check,
        is_anomaly: true,
        severity: Some(severity),
        observed: (expected_days - missing.len() as i64) as f64,
        expected: expected_days as f64,
        merchant_message: "Some days are missing from this data source. Totals may be incomplete."
            .to_string(),
        support_details: format!(
            "{} missing days in range {start}..={end}: {:?}",
            missing.len(),
            missing.iter().take(10).collect::<Vec<_>>()
        ),
    }
}

/// Negative values in a field that must be positive.
pub fn check_negative_values(field_name: &str, values: &[f64]) -> AnomalyResult {
    let check = AnomalyCheck::NegativeValues;
    let negatives: Vec<f64> = values.iter().copied().filter(|v| *v < 0.0).collect();

    if negatives.is_empty() {
        return AnomalyResult::clear(
            check,
            0.0,
            0.0,
            format!("no negative values in {field_name}"),
        );
    }

    AnomalyResult {
        check,
        is_anomaly: true,
        severity: Some(DqSeverity::High),
        observed: negatives.len() as f64,
        expected: 0.0,
        merchant_message: "We found inconsistent values in this data source and are reviewing them."
            .to_string(),
        support_details: format!(
            "{} negative values in field '{field_name}' (min {:.2})",
            negatives.len(),
            negatives.iter().copied().fold(f64::INFINITY, f64::min)
        ),
    }
}

/// Duplicate primary keys in an extracted batch.
pub fn check_duplicate_primary_keys(keys: &[String]) -> AnomalyResult {
    let check = AnomalyCheck::DuplicatePrimaryKeys;
    let mut seen = HashSet::new();
    let mut duplicates = HashSet::new();
    for key in keys {
        if !seen.insert(key) {
            duplicates.insert(key.clone());
        }
    }

    if duplicates.is_empty() {
        return AnomalyResult::clear(
            check,
            keys.len() as f64,
            keys.len() as f64,
            "primary keys are unique".to_string(),
        );
    }

    AnomalyResult {
        check,
        is_anomaly: true,
        severity: Some(DqSeverity::High),
        observed: duplicates.len() as f64,
        expected: 0.0,
        merchant_message: "We detected duplicated records in this data source and are deduplicating them."
            .to_string(),
        support_details: format!(
            "{} duplicate primary keys, e.g. {:?}",
            duplicates.len(),
            duplicates.iter().take(5).collect::<Vec<_>>()
        ),
    }
}

/// Per-currency revenue/spend divergence: flags currencies where revenue
/// and spend moved in opposite directions by at least
/// `threshold_percent` each.
pub fn check_revenue_spend_divergence(
    deltas_by_currency: &HashMap<String, (f64, f64)>,
    threshold_percent: f64,
) -> AnomalyResult {
    let check = AnomalyCheck::RevenueSpendDivergence;
    let mut diverging: Vec<(&str, f64, f64)> = Vec::new();

    for (currency, (revenue_delta, spend_delta)) in deltas_by_currency {
        let opposite = (revenue_delta.signum() * spend_delta.signum()) < 0.0;
        if opposite
            && revenue_delta.abs() >= threshold_percent
            && spend_delta.abs() >= threshold_percent
        {
            diverging.push((currency.as_str(), *revenue_delta, *spend_delta));
        }
    }

    if diverging.is_empty() {
        return AnomalyResult::clear(
            check,
            0.0,
            0.0,
            "revenue and spend directions agree across currencies".to_string(),
        );
    }

    let worst = diverging
        .iter()
        .map(|(_, r, s)| r.abs().max(s.abs()))
        .fold(0.0, f64::max);

    AnomalyResult {
        check,
        is_anomaly: true,
        severity: Some(DqSeverity::Warning),
        observed: worst,
        expected: threshold_percent,
        merchant_message: "Revenue and ad spend are trending in opposite directions. Worth a look."
            .to_string(),
        support_details: format!(
            "diverging currencies: {:?}",
            diverging
                .iter()
                .map(|(c, r, s)| format!("{c}: revenue {r:+.1}% spend {s:+.1}%"))
                .collect::<Vec<_>>()
        ),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_count_drop_thresholds() {
        // 50% drop at the default threshold → warning
        let result = check_row_count_drop(1000, 500, 50.0);
        assert!(result.is_anomaly);
        assert_eq!(result.severity, Some(DqSeverity::Warning));

        // 75% drop → high
        let result = check_row_count_drop(1000, 250, 50.0);
        assert_eq!(result.severity, Some(DqSeverity::High));

        // 49% drop → clean
        let result = check_row_count_drop(1000, 510, 50.0);
        assert!(!result.is_anomaly);

        // No baseline → clean
        assert!(!check_row_count_drop(0, 0, 50.0).is_anomaly);
    }

    #[test]
    fn test_zero_spend() {
        assert!(check_zero_spend(120.0, 0.0).is_anomaly);
        assert!(!check_zero_spend(0.0, 0.0).is_anomaly);
        assert!(!check_zero_spend(120.0, 80.0).is_anomaly);
    }

    #[test]
    fn test_zero_orders_always_critical() {
        let result = check_zero_orders(42, 0);
        assert!(result.is_anomaly);
        assert_eq!(result.severity, Some(DqSeverity::Critical));
        assert!(!check_zero_orders(0, 0).is_anomaly);
    }

    #[test]
    fn test_missing_days_escalation() {
        let start = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 5, 10).unwrap();

        // Three missing days → warning
        let present: Vec<NaiveDate> = (1..=10)
            .filter(|d| ![2, 5, 7].contains(d))
            .map(|d| NaiveDate::from_ymd_opt(2025, 5, d).unwrap())
            .collect();
        let result = check_missing_days(&present, start, end);
        assert!(result.is_anomaly);
        assert_eq!(result.severity, Some(DqSeverity::Warning));

        // Four missing days → high
        let present: Vec<NaiveDate> = (1..=10)
            .filter(|d| ![2, 5, 7, 9].contains(d))
            .map(|d| NaiveDate::from_ymd_opt(2025, 5, d).unwrap())
            .collect();
        let result = check_missing_days(&present, start, end);
        assert_eq!(result.severity, Some(DqSeverity::High));

        // Complete series → clean
        let present: Vec<NaiveDate> = (1..=10)
            .map(|d| NaiveDate::from_ymd_opt(2025, 5, d).unwrap())
            .collect();
        assert!(!check_missing_days(&present, start, end).is_anomaly);
    }

    #[test]
    fn test_negative_values() {
        let result = check_negative_values("order_total", &[10.0, -2.5, 3.0]);
        assert!(result.is_anomaly);
        assert!(result.support_details.contains("order_total"));
        assert!(!check_negative_values("order_total", &[1.0, 2.0]).is_anomaly);
    }

    #[test]
    fn test_duplicate_primary_keys() {
        let keys = vec![
            "order_1".to_string(),
            "order_2".to_string(),
            "order_1".to_string(),
        ];
        let result = check_duplicate_primary_keys(&keys);
        assert!(result.is_anomaly);
        assert_eq!(result.observed, 1.0);
        assert!(!check_duplicate_primary_keys(&["a".to_string(), "b".to_string()]).is_anomaly);
    }

    #[test]
    fn test_divergence_flags_opposite_moves() {
        let mut deltas = HashMap::new();
        deltas.insert("USD".to_string(), (-25.0, 30.0));
        deltas.insert("EUR".to_string(), (10.0, 12.0));
        let result = check_revenue_spend_divergence(&deltas, 20.0);
        assert!(result.is_anomaly);
        assert!(result.support_details.contains("USD"));

        // Same direction moves are not divergence
        let mut agreeing = HashMap::new();
        agreeing.insert("USD".to_string(), (25.0, 30.0));
        assert!(!check_revenue_spend_divergence(&agreeing, 20.0).is_anomaly);

        // Opposite but below threshold
        let mut small = HashMap::new();
        small.insert("USD".to_string(), (-5.0, 6.0));
        assert!(!check_revenue_spend_divergence(&small, 20.0).is_anomaly);
    }

    #[test]
    fn test_merchant_messages_hide_internals() {
        let result = check_row_count_drop(1000, 100, 50.0);
        assert!(!result.merchant_message.contains("1000"));
        assert!(!result.merchant_message.contains("row"));
        assert!(result.support_details.contains("1000"));
    }
}
