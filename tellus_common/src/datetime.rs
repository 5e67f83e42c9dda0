/*
 * Copyright © 2025, United States Government, as represented by the Administrator of
 * the National Aeronautics and Space Administration. All rights reserved.
 *
 * The “TELLUS” software is licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License. You may obtain a copy
 * of the License at http://www.apache.org/licenses/LICENSE-2.0.
 *
 * Unless required by applicable law or agreed to in writing, software distributed under
 * the License is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND,
 * either express or implied. See the License for the specific language governing permissions
 * and limitations under the License.
 */

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use std::time::Duration;

// simple std::time::Duration ctors so call sites don't have to spell out the units
#[inline] pub const fn secs(n: u64) -> Duration { Duration::from_secs(n) }
#[inline] pub const fn minutes(n: u64) -> Duration { Duration::from_secs(n * 60) }
#[inline] pub const fn hours(n: u64) -> Duration { Duration::from_secs(n * 3600) }
#[inline] pub const fn days(n: u64) -> Duration { Duration::from_secs(n * 86400) }

/// the full hour for given instant (minutes, seconds and nanos zeroed)
pub fn hour_start(dt: &DateTime<Utc>) -> DateTime<Utc> {
    dt.with_minute(0).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap()
}

/// midnight of the day containing the instant
pub fn day_start(dt: &DateTime<Utc>) -> DateTime<Utc> {
    hour_start(dt).with_hour(0).unwrap()
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.unwrap().pred_opt().unwrap().day()
}

/// parse an ISO date or datetime string into a Utc instant. Accepted forms are
/// "%Y-%m-%d", "%Y-%m-%dT%H:%M[:%S]", "%Y-%m-%d %H:%M[:%S]" and full RFC 3339
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.to_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(ndt, Utc));
        }
    }
    if let Ok(nd) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let ndt = NaiveDateTime::new(nd, NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        return Some(DateTime::from_naive_utc_and_offset(ndt, Utc));
    }
    None
}

pub fn short_utc_string(dt: &DateTime<Utc>) -> String {
    format!("{}", dt.format("%Y-%m-%dT%H:%M:%SZ"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dates_and_datetimes() {
        assert_eq!(parse_instant("2024-02-01").unwrap().hour(), 0);
        assert_eq!(parse_instant("2024-02-01 06:30").unwrap().minute(), 30);
        assert_eq!(parse_instant("2024-02-01T06:30:15").unwrap().second(), 15);
        assert!(parse_instant("02/01/2024").is_none());
    }

    #[test]
    fn month_lengths() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2023, 12), 31);
    }
}
