use chrono::{Datelike as _, Days, NaiveDate};

use crate::error::EpicastError;

/// Date format used by every source payload.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/**
Parse a `YYYY-MM-DD` string into a NaiveDate.

## Arguments
* `value` - The date string to parse.

## Returns
The parsed date or an EpicastError::ParseDate if the string is malformed.
 */
pub fn parse_date(value: &str) -> Result<NaiveDate, EpicastError> {
    Ok(NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)?)
}

/**
Number of calendar days from `origin` to `date`. Negative if `date` precedes `origin`.
This is the time index formula: every location shares the same origin, so one
index step is always one day.
 */
pub fn days_since(date: NaiveDate, origin: NaiveDate) -> i64 {
    date.signed_duration_since(origin).num_days()
}

/**
Shift a date forward by `days` calendar days.

## Returns
The shifted date, or a DateConversion error if the result leaves chrono's range.
 */
pub fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate, EpicastError> {
    date.checked_add_days(Days::new(days)).ok_or_else(|| {
        EpicastError::DateConversion(format!("Cannot add {} days to {}", days, date))
    })
}

/// Month categorical label ("1" through "12").
pub fn month_label(date: NaiveDate) -> String {
    date.month().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_valid() {
        let date = parse_date("2021-03-14").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2021, 3, 14).unwrap());
        assert_eq!(parse_date(" 2021-03-14 ").unwrap(), date);
    }

    #[test]
    fn test_parse_date_invalid() {
        assert!(matches!(
            parse_date("14/03/2021"),
            Err(EpicastError::ParseDate(_))
        ));
    }

    #[test]
    fn test_days_since_spans_years() {
        let origin = NaiveDate::from_ymd_opt(2020, 2, 24).unwrap();
        assert_eq!(days_since(origin, origin), 0);
        let next_year = NaiveDate::from_ymd_opt(2021, 2, 24).unwrap();
        // 2020 is a leap year
        assert_eq!(days_since(next_year, origin), 366);
        let before = NaiveDate::from_ymd_opt(2020, 2, 20).unwrap();
        assert_eq!(days_since(before, origin), -4);
    }

    #[test]
    fn test_add_days_crosses_month() {
        let date = NaiveDate::from_ymd_opt(2021, 1, 30).unwrap();
        let shifted = add_days(date, 3).unwrap();
        assert_eq!(shifted, NaiveDate::from_ymd_opt(2021, 2, 2).unwrap());
        assert_eq!(month_label(shifted), "2");
    }

    #[test]
    fn test_add_days_overflow() {
        let result = add_days(NaiveDate::MAX, 1);
        assert!(matches!(result, Err(EpicastError::DateConversion(_))));
    }
}
