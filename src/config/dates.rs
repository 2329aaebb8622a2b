use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::errors::Result;

/// Default location of the line-delimited holiday files.
pub const HOLIDAY_DIR: &str = "/datasource/inbound/source_file/mdp/sfv";

/// Collect the distinct holiday dates from every `holiday_*.txt` file under
/// `dir`, one `YYYY-MM-DD` date per line. Blank lines are skipped; the result
/// is sorted.
pub fn load_holidays(dir: &Path) -> Result<Vec<String>> {
    let pattern = dir.join("holiday_*.txt");
    let mut holidays: BTreeSet<String> = BTreeSet::new();

    for entry in glob::glob(&pattern.to_string_lossy())? {
        let path = entry?;
        let content = fs::read_to_string(&path)?;
        holidays.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }

    Ok(holidays.into_iter().collect())
}

fn is_business_day(date: NaiveDate, holidays: &[String]) -> bool {
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let rendered = date.format("%Y-%m-%d").to_string();
    !holidays.contains(&rendered)
}

/// Shift `date_str` by `offset` business days, skipping weekends and the
/// provided holiday set. `offset = -1` yields the previous business day.
pub fn offset_business_days(date_str: &str, holidays: &[String], offset: i64) -> Result<String> {
    let mut date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")?;
    let step = if offset < 0 { -1 } else { 1 };
    let mut remaining = offset.abs();

    while remaining > 0 {
        date = date + Duration::days(step);
        if is_business_day(date, holidays) {
            remaining -= 1;
        }
    }

    Ok(date.format("%Y-%m-%d").to_string())
}
