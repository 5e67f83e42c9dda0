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

///! calendar frequencies, time ranges and their expansion into retrieval timesteps

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datetime::{day_start, days_in_month, hour_start, parse_instant};

pub type Result<T> = std::result::Result<T, TimeError>;

#[derive(Error, Debug)]
pub enum TimeError {
    #[error("cannot parse instant {0}")]
    ParseError(String),

    #[error("unknown frequency {0}")]
    UnknownFreq(String),

    #[error("empty instant list")]
    EmptyRange,
}

/// day-of-year start days of the fixed 8-day VIIRS/MODIS compositing periods (1,9,..,361)
const VIIRS_DOYS: usize = 46;

/* #region TimeRange *********************************************************************************/

/// an ordered, immutable pair of instants. Inverted input bounds are swapped on construction
/// so that `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        if a <= b {
            TimeRange { start: a, end: b }
        } else {
            TimeRange { start: b, end: a }
        }
    }

    /// parse from ISO date ("2024-01-31") or datetime strings
    pub fn parse(a: &str, b: &str) -> Result<Self> {
        let ia = parse_instant(a).ok_or_else(|| TimeError::ParseError(a.to_string()))?;
        let ib = parse_instant(b).ok_or_else(|| TimeError::ParseError(b.to_string()))?;
        Ok(TimeRange::new(ia, ib))
    }

    /// collapse an unordered instant sequence to its (min,max) envelope
    pub fn from_instants(instants: &[DateTime<Utc>]) -> Result<Self> {
        let min = instants.iter().min().ok_or(TimeError::EmptyRange)?;
        let max = instants.iter().max().ok_or(TimeError::EmptyRange)?;
        Ok(TimeRange::new(*min, *max))
    }

    #[inline]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[inline]
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, dt: &DateTime<Utc>) -> bool {
        *dt >= self.start && *dt <= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.start, self.end)
    }
}

/* #endregion TimeRange */

/* #region Freq **************************************************************************************/

/// a calendar frequency. This is what turns a TimeRange into the ordered set of retrieval
/// targets - each variant knows how to snap an instant to its containing step and how to
/// move whole steps forward/backward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freq {
    Hourly,
    Daily,
    Dekadly,
    Monthly,
    Yearly,
    Viirs8Day,
    /// NWP issue hours within a day, e.g. [0,6,12,18]
    IssueHours(Vec<u32>),
}

impl Freq {
    pub fn from_name(name: &str) -> Result<Freq> {
        match name.to_lowercase().as_str() {
            "hourly" => Ok(Freq::Hourly),
            "daily" => Ok(Freq::Daily),
            "dekadly" | "dekads" => Ok(Freq::Dekadly),
            "monthly" => Ok(Freq::Monthly),
            "yearly" | "annual" => Ok(Freq::Yearly),
            "viirs-8day" | "8day" => Ok(Freq::Viirs8Day),
            other => Err(TimeError::UnknownFreq(other.to_string())),
        }
    }

    pub fn from_ts_per_year(n: u32) -> Result<Freq> {
        match n {
            1 => Ok(Freq::Yearly),
            12 => Ok(Freq::Monthly),
            36 => Ok(Freq::Dekadly),
            365 => Ok(Freq::Daily),
            8760 => Ok(Freq::Hourly),
            other => Err(TimeError::UnknownFreq(format!("ts_per_year={}", other))),
        }
    }

    pub fn issue_hours(hours: &[u32]) -> Freq {
        let mut hs: Vec<u32> = hours.to_vec();
        hs.sort();
        hs.dedup();
        Freq::IssueHours(hs)
    }
}

impl fmt::Display for Freq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freq::Hourly => write!(f, "hourly"),
            Freq::Daily => write!(f, "daily"),
            Freq::Dekadly => write!(f, "dekadly"),
            Freq::Monthly => write!(f, "monthly"),
            Freq::Yearly => write!(f, "yearly"),
            Freq::Viirs8Day => write!(f, "viirs-8day"),
            Freq::IssueHours(hs) => write!(f, "issue-hours{:?}", hs),
        }
    }
}

/* #endregion Freq */

/* #region TimeStep **********************************************************************************/

/// a closed calendar interval typed by frequency. Two steps of the same frequency either
/// coincide or are disjoint and ordered - comparison is by start instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeStep {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    freq: Freq,
}

impl TimeStep {
    /// the step of `freq` containing `dt`
    pub fn of(dt: DateTime<Utc>, freq: &Freq) -> TimeStep {
        let start = match freq {
            Freq::Hourly => hour_start(&dt),
            Freq::Daily => day_start(&dt),
            Freq::Dekadly => {
                let d = if dt.day() >= 21 { 21 } else if dt.day() >= 11 { 11 } else { 1 };
                Utc.with_ymd_and_hms(dt.year(), dt.month(), d, 0, 0, 0).unwrap()
            }
            Freq::Monthly => Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0).unwrap(),
            Freq::Yearly => Utc.with_ymd_and_hms(dt.year(), 1, 1, 0, 0, 0).unwrap(),
            Freq::Viirs8Day => {
                let idx = (((dt.ordinal() - 1) / 8) as usize).min(VIIRS_DOYS - 1);
                viirs_start(dt.year(), idx)
            }
            Freq::IssueHours(hs) => {
                // most recent run at or before dt, possibly on the previous day
                match hs.iter().rev().find(|&&h| h <= dt.hour()) {
                    Some(&h) => day_start(&dt) + Duration::hours(h as i64),
                    None => {
                        let prev = day_start(&dt) - Duration::days(1);
                        prev + Duration::hours(*hs.last().unwrap_or(&0) as i64)
                    }
                }
            }
        };
        TimeStep::from_start(start, freq.clone())
    }

    fn from_start(start: DateTime<Utc>, freq: Freq) -> TimeStep {
        let end = step_end(&start, &freq);
        TimeStep { start, end, freq }
    }

    #[inline]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[inline]
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    #[inline]
    pub fn freq(&self) -> &Freq {
        &self.freq
    }

    /// move `n` whole steps (negative moves backward)
    pub fn add(&self, n: i64) -> TimeStep {
        if n == 0 {
            return self.clone();
        }
        let start = match &self.freq {
            Freq::Hourly => self.start + Duration::hours(n),
            Freq::Daily => self.start + Duration::days(n),
            Freq::Dekadly => {
                let dk = (self.start.year() as i64 * 12 + (self.start.month() as i64 - 1)) * 3
                    + (self.dekad_of_month() as i64 - 1)
                    + n;
                let year = dk.div_euclid(36);
                let rem = dk.rem_euclid(36);
                let month = (rem / 3) as u32 + 1;
                let day = [1u32, 11, 21][(rem % 3) as usize];
                Utc.with_ymd_and_hms(year as i32, month, day, 0, 0, 0).unwrap()
            }
            Freq::Monthly => {
                let m = self.start.year() as i64 * 12 + (self.start.month() as i64 - 1) + n;
                let year = m.div_euclid(12) as i32;
                let month = m.rem_euclid(12) as u32 + 1;
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
            }
            Freq::Yearly => {
                Utc.with_ymd_and_hms(self.start.year() + n as i32, 1, 1, 0, 0, 0).unwrap()
            }
            Freq::Viirs8Day => {
                let idx = ((self.start.ordinal() - 1) / 8) as i64;
                let g = self.start.year() as i64 * VIIRS_DOYS as i64 + idx + n;
                let year = g.div_euclid(VIIRS_DOYS as i64) as i32;
                let i = g.rem_euclid(VIIRS_DOYS as i64) as usize;
                viirs_start(year, i)
            }
            Freq::IssueHours(hs) => {
                let len = hs.len() as i64;
                let pos = hs.iter().position(|&h| h == self.start.hour()).unwrap_or(0) as i64;
                let g = pos + n;
                let day_shift = g.div_euclid(len);
                let i = g.rem_euclid(len) as usize;
                day_start(&self.start) + Duration::days(day_shift) + Duration::hours(hs[i] as i64)
            }
        };
        TimeStep::from_start(start, self.freq.clone())
    }

    pub fn succ(&self) -> TimeStep {
        self.add(1)
    }

    pub fn pred(&self) -> TimeStep {
        self.add(-1)
    }

    //--- calendar accessors (of the start instant)

    #[inline] pub fn year(&self) -> i32 { self.start.year() }
    #[inline] pub fn month(&self) -> u32 { self.start.month() }
    #[inline] pub fn day(&self) -> u32 { self.start.day() }
    #[inline] pub fn hour(&self) -> u32 { self.start.hour() }
    #[inline] pub fn doy(&self) -> u32 { self.start.ordinal() }

    /// 1,2 or 3 - day 31 belongs to dekad 3
    pub fn dekad_of_month(&self) -> u32 {
        match self.start.day() {
            d if d >= 21 => 3,
            d if d >= 11 => 2,
            _ => 1,
        }
    }

    /// substitute the supported strftime tokens of `template` with the calendar fields of
    /// the step start. Unknown '%' tokens survive literally (template safety)
    pub fn format_tokens(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len() + 8);
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('Y') => { out.push_str(&format!("{:04}", self.year())); chars.next(); }
                Some('y') => { out.push_str(&format!("{:02}", self.year() % 100)); chars.next(); }
                Some('m') => { out.push_str(&format!("{:02}", self.month())); chars.next(); }
                Some('d') => { out.push_str(&format!("{:02}", self.day())); chars.next(); }
                Some('H') => { out.push_str(&format!("{:02}", self.hour())); chars.next(); }
                Some('M') => { out.push_str(&format!("{:02}", self.start.minute())); chars.next(); }
                Some('S') => { out.push_str(&format!("{:02}", self.start.second())); chars.next(); }
                Some('j') => { out.push_str(&format!("{:03}", self.doy())); chars.next(); }
                _ => out.push('%'),
            }
        }
        out
    }
}

impl PartialEq for TimeStep {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start
    }
}
impl Eq for TimeStep {}

impl PartialOrd for TimeStep {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimeStep {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start)
    }
}

impl fmt::Display for TimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.freq, self.start.format("%Y-%m-%dT%H:%MZ"))
    }
}

fn viirs_start(year: i32, idx: usize) -> DateTime<Utc> {
    let doy = 1 + 8 * idx as u32;
    let nd = NaiveDate::from_yo_opt(year, doy).unwrap(); // doy <= 361, valid in all years
    Utc.with_ymd_and_hms(nd.year(), nd.month(), nd.day(), 0, 0, 0).unwrap()
}

fn step_end(start: &DateTime<Utc>, freq: &Freq) -> DateTime<Utc> {
    let one_sec = Duration::seconds(1);
    match freq {
        Freq::Hourly => *start + Duration::hours(1) - one_sec,
        Freq::Daily => *start + Duration::days(1) - one_sec,
        Freq::Dekadly => {
            if start.day() == 21 {
                let last = days_in_month(start.year(), start.month());
                Utc.with_ymd_and_hms(start.year(), start.month(), last, 23, 59, 59).unwrap()
            } else {
                *start + Duration::days(10) - one_sec
            }
        }
        Freq::Monthly => {
            let last = days_in_month(start.year(), start.month());
            Utc.with_ymd_and_hms(start.year(), start.month(), last, 23, 59, 59).unwrap()
        }
        Freq::Yearly => Utc.with_ymd_and_hms(start.year(), 12, 31, 23, 59, 59).unwrap(),
        Freq::Viirs8Day => {
            let idx = ((start.ordinal() - 1) / 8) as usize;
            if idx >= VIIRS_DOYS - 1 {
                Utc.with_ymd_and_hms(start.year(), 12, 31, 23, 59, 59).unwrap()
            } else {
                *start + Duration::days(8) - one_sec
            }
        }
        Freq::IssueHours(_) => *start, // the run instant is the step
    }
}

/* #endregion TimeStep */

/* #region expansion *********************************************************************************/

/// expand a time range into the ordered list of timesteps at the given frequency.
///
/// Hourly expansion starts at the first minute-0 instant at or after the range start; all
/// other frequencies start at the step containing the range start. Monthly (and coarser)
/// expansion is end-inclusive - a range ending anywhere inside month M includes M. Issue-hour
/// expansion emits one step per configured hour-of-day that falls inside the closed range.
pub fn expand(range: &TimeRange, freq: &Freq) -> Vec<TimeStep> {
    let mut steps = Vec::new();

    match freq {
        Freq::Hourly => {
            let mut s = hour_start(&range.start());
            if s < range.start() {
                s = s + Duration::hours(1);
            }
            let mut ts = TimeStep::from_start(s, freq.clone());
            while ts.start <= range.end() {
                steps.push(ts.clone());
                ts = ts.succ();
            }
        }
        Freq::IssueHours(hs) => {
            let mut day = day_start(&range.start());
            let last_day = day_start(&range.end());
            while day <= last_day {
                for &h in hs {
                    let run = day + Duration::hours(h as i64);
                    if range.contains(&run) {
                        steps.push(TimeStep::from_start(run, freq.clone()));
                    }
                }
                day = day + Duration::days(1);
            }
        }
        _ => {
            let mut ts = TimeStep::of(range.start(), freq);
            while ts.start <= range.end() {
                steps.push(ts.clone());
                ts = ts.succ();
            }
        }
    }

    steps
}

/* #endregion expansion */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn range_normalizes_inverted_bounds() {
        let a = utc(2024, 3, 2, 0, 0);
        let b = utc(2024, 1, 1, 0, 0);
        assert_eq!(TimeRange::new(a, b), TimeRange::new(b, a));
        assert_eq!(TimeRange::new(a, b).start(), b);
    }

    #[test]
    fn range_from_instants() {
        let v = vec![utc(2024, 5, 2, 0, 0), utc(2024, 5, 1, 0, 0), utc(2024, 5, 9, 0, 0)];
        let r = TimeRange::from_instants(&v).unwrap();
        assert_eq!(r.start(), utc(2024, 5, 1, 0, 0));
        assert_eq!(r.end(), utc(2024, 5, 9, 0, 0));
    }

    #[test]
    fn hourly_starts_at_next_full_hour() {
        let r = TimeRange::new(utc(2024, 1, 1, 10, 30), utc(2024, 1, 1, 13, 0));
        let steps = expand(&r, &Freq::Hourly);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].start(), utc(2024, 1, 1, 11, 0));
        assert_eq!(steps[2].start(), utc(2024, 1, 1, 13, 0));
    }

    #[test]
    fn dekads_partition_month() {
        let r = TimeRange::parse("2023-01-05", "2023-02-01").unwrap();
        let steps = expand(&r, &Freq::Dekadly);
        let starts: Vec<u32> = steps.iter().map(|s| s.day()).collect();
        assert_eq!(starts, vec![1, 11, 21, 1]);
        assert_eq!(steps[2].end(), utc(2023, 1, 31, 23, 59) + Duration::seconds(59));
        assert_eq!(steps[2].dekad_of_month(), 3);
    }

    #[test]
    fn day_31_is_dekad_3() {
        let ts = TimeStep::of(utc(2023, 1, 31, 12, 0), &Freq::Dekadly);
        assert_eq!(ts.dekad_of_month(), 3);
        assert_eq!(ts.day(), 21);
    }

    #[test]
    fn monthly_is_end_inclusive() {
        let r = TimeRange::parse("2024-01-15", "2024-03-02").unwrap();
        let steps = expand(&r, &Freq::Monthly);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].start(), utc(2024, 1, 1, 0, 0));
        assert_eq!(steps[2].month(), 3);
    }

    #[test]
    fn viirs_8day_fixed_doy_list() {
        // 2017-02-02 is doy 33 = 1 + 8*4, a period start
        let ts = TimeStep::of(utc(2017, 2, 2, 0, 0), &Freq::Viirs8Day);
        assert_eq!(ts.doy(), 33);
        assert_eq!(ts.succ().doy(), 41);

        // last period of the year runs from doy 361 to Dec 31
        let last = TimeStep::of(utc(2017, 12, 31, 0, 0), &Freq::Viirs8Day);
        assert_eq!(last.doy(), 361);
        assert_eq!(last.end(), utc(2017, 12, 31, 23, 59) + Duration::seconds(59));
        assert_eq!(last.succ().year(), 2018);
        assert_eq!(last.succ().doy(), 1);
    }

    #[test]
    fn issue_hours_hit_exact_run_times() {
        let freq = Freq::issue_hours(&[0, 6, 12, 18]);
        let r = TimeRange::new(utc(2024, 2, 1, 0, 0), utc(2024, 2, 1, 12, 0));
        let steps = expand(&r, &freq);
        let hours: Vec<u32> = steps.iter().map(|s| s.hour()).collect();
        assert_eq!(hours, vec![0, 6, 12]);
    }

    #[test]
    fn issue_hour_step_arithmetic_crosses_days() {
        let freq = Freq::issue_hours(&[0, 12]);
        let ts = TimeStep::of(utc(2024, 2, 1, 13, 0), &freq);
        assert_eq!(ts.start(), utc(2024, 2, 1, 12, 0));
        assert_eq!(ts.succ().start(), utc(2024, 2, 2, 0, 0));
        assert_eq!(ts.pred().start(), utc(2024, 2, 1, 0, 0));
    }

    #[test]
    fn expansion_covers_range_without_overlap() {
        let r = TimeRange::parse("2023-11-20", "2024-01-10").unwrap();
        for freq in [Freq::Daily, Freq::Dekadly, Freq::Monthly, Freq::Viirs8Day] {
            let steps = expand(&r, &freq);
            for w in steps.windows(2) {
                assert_eq!(w[0].succ(), w[1], "{freq}: gap after {}", w[0]);
                assert!(w[0].end() < w[1].start(), "{freq}: overlap at {}", w[1]);
            }
            assert!(steps.first().unwrap().start() <= r.start());
            assert!(steps.last().unwrap().end() >= r.end());
        }
    }

    #[test]
    fn token_formatting_keeps_unknown_tokens() {
        let ts = TimeStep::of(utc(2023, 12, 30, 6, 0), &Freq::Daily);
        assert_eq!(ts.format_tokens("rain_%Y%m%d.tif"), "rain_20231230.tif");
        assert_eq!(ts.format_tokens("x_%Q_%j"), "x_%Q_364");
    }

    #[test]
    fn unknown_frequencies_are_refused() {
        assert!(Freq::from_name("weekly").is_err());
        assert!(Freq::from_ts_per_year(52).is_err());
        assert!(matches!(Freq::from_ts_per_year(36), Ok(Freq::Dekadly)));
    }
}
