//! Time-related utilities

use chrono::{DateTime, Local, NaiveDateTime};

const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Render a wall-clock time the way the `prf stm` record carries it
pub fn format_start_time(time: DateTime<Local>) -> String {
    time.format(START_TIME_FORMAT).to_string()
}

/// Current local time in the `prf stm` format
pub fn start_time_now() -> String {
    format_start_time(Local::now())
}

/// Parse the text of a `prf stm` record
pub fn parse_start_time(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), START_TIME_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_format_start_time() {
        let time = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(format_start_time(time), "2024-03-05 07:08:09.000");
    }

    #[test]
    fn test_start_time_parses_back() {
        let text = start_time_now();
        let parsed = parse_start_time(&text).unwrap();
        assert!(parsed.hour() < 24);
        assert!(parse_start_time("not a time").is_none());
    }
}
