use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }

    pub fn contains(self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Asymmetric window around a pivot date. Payments usually arrive a few
/// days after the invoice, so the lookback side is wider than the
/// lookahead side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub days_before: i64,
    pub days_after: i64,
}

impl Default for DateWindow {
    fn default() -> Self {
        DateWindow {
            days_before: 7,
            days_after: 3,
        }
    }
}

impl DateWindow {
    pub fn new(days_before: i64, days_after: i64) -> Self {
        DateWindow {
            days_before,
            days_after,
        }
    }

    pub fn around(self, pivot: NaiveDate) -> DateRange {
        DateRange {
            start: pivot - Duration::days(self.days_before),
            end: pivot + Duration::days(self.days_after),
        }
    }

    /// Widest offset the window accepts, used to normalise date scores.
    pub fn span_days(self) -> i64 {
        self.days_before.max(self.days_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn window_is_asymmetric() {
        let range = DateWindow::default().around(d(2025, 10, 15));
        assert_eq!(range.start, d(2025, 10, 8));
        assert_eq!(range.end, d(2025, 10, 18));
    }

    #[test]
    fn range_contains_bounds() {
        let range = DateRange::new(d(2025, 1, 1), d(2025, 1, 31));
        assert!(range.contains(d(2025, 1, 1)));
        assert!(range.contains(d(2025, 1, 31)));
        assert!(!range.contains(d(2025, 2, 1)));
    }
}
