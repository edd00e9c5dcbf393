//! Billing-period interval arithmetic.
//!
//! Cycle advancement and due-date anchors are computed in UTC. Month and
//! year addition clamp the day-of-month to the target month's length, so
//! Jan 31 + 1 month is Feb 29 on a leap year and Feb 28 otherwise.

use time::util::days_in_month;
use time::{Date, Duration, Month, OffsetDateTime};

/// Plan interval unit. `Custom` intervals are plain day counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Year,
    Custom,
}

impl IntervalUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Advance `from` by `count` units.
pub fn add_interval(from: OffsetDateTime, unit: IntervalUnit, count: i64) -> OffsetDateTime {
    match unit {
        IntervalUnit::Day | IntervalUnit::Custom => from + Duration::days(count),
        IntervalUnit::Week => from + Duration::days(count * 7),
        IntervalUnit::Month => {
            let date = add_months(from.date(), count);
            from.replace_date(date)
        }
        IntervalUnit::Year => {
            let date = add_months(from.date(), count * 12);
            from.replace_date(date)
        }
    }
}

fn add_months(date: Date, months: i64) -> Date {
    let zero_based = (date.year() as i64) * 12 + (date.month() as i64 - 1) + months;
    let year = zero_based.div_euclid(12) as i32;
    let month_number = (zero_based.rem_euclid(12) + 1) as u8;
    // month_number is always 1..=12 here
    let month = Month::try_from(month_number).unwrap_or(Month::January);

    let day = date.day().min(days_in_month(month, year));
    // Clamped day is always valid for (year, month)
    Date::from_calendar_date(year, month, day).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn month_addition_clamps_to_leap_february() {
        let jan31 = datetime!(2024-01-31 10:00 UTC);
        let next = add_interval(jan31, IntervalUnit::Month, 1);
        assert_eq!(next.date(), time::macros::date!(2024 - 02 - 29));
        // Time of day is preserved
        assert_eq!(next.time(), jan31.time());
    }

    #[test]
    fn month_addition_clamps_to_non_leap_february() {
        let jan31 = datetime!(2023-01-31 00:00 UTC);
        let next = add_interval(jan31, IntervalUnit::Month, 1);
        assert_eq!(next.date(), time::macros::date!(2023 - 02 - 28));
    }

    #[test]
    fn month_addition_crosses_year_boundary() {
        let nov30 = datetime!(2024-11-30 12:00 UTC);
        let next = add_interval(nov30, IntervalUnit::Month, 3);
        assert_eq!(next.date(), time::macros::date!(2025 - 02 - 28));
    }

    #[test]
    fn weeks_add_exact_days() {
        let start = datetime!(2024-03-01 08:30 UTC);
        let next = add_interval(start, IntervalUnit::Week, 2);
        assert_eq!(next - start, Duration::days(14));
    }

    #[test]
    fn custom_units_are_day_counts() {
        let start = datetime!(2024-03-01 08:30 UTC);
        let next = add_interval(start, IntervalUnit::Custom, 45);
        assert_eq!(next - start, Duration::days(45));
    }

    #[test]
    fn year_addition_handles_leap_day() {
        let feb29 = datetime!(2024-02-29 00:00 UTC);
        let next = add_interval(feb29, IntervalUnit::Year, 1);
        assert_eq!(next.date(), time::macros::date!(2025 - 02 - 28));
    }

    #[test]
    fn interval_unit_parsing() {
        assert_eq!(IntervalUnit::parse("month"), Some(IntervalUnit::Month));
        assert_eq!(IntervalUnit::parse("custom"), Some(IntervalUnit::Custom));
        assert_eq!(IntervalUnit::parse("fortnight"), None);
    }
}
