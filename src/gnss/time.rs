//! Composite GNSS time
//!
//! Integer seconds since the GPS epoch (1980-01-06 00:00:00 UTC) plus a fractional second in
//! [0, 1). Keeping the two parts apart preserves sub-nanosecond resolution over multi-day
//! sessions, which a single f64 of seconds-since-1980 cannot.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const SECONDS_PER_WEEK: i64 = 604_800;

/// GPS - UTC offset in seconds (valid since 2017-01-01)
pub const GPS_UTC_LEAP_SECONDS: i64 = 18;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct GnssTime {
    sec: i64,
    frac: f64,
}

impl GnssTime {
    /// Build from whole and fractional seconds, normalizing `frac` into [0, 1)
    pub fn new(sec: i64, frac: f64) -> Self {
        let carry = frac.floor();
        let mut out = Self {
            sec: sec + carry as i64,
            frac: frac - carry,
        };
        if out.frac >= 1.0 {
            out.sec += 1;
            out.frac -= 1.0;
        }
        out
    }

    pub fn from_week_tow(week: i32, tow: f64) -> Self {
        Self::new(week as i64 * SECONDS_PER_WEEK, tow)
    }

    /// Convert a UTC calendar time to GNSS time
    pub fn from_utc(utc: DateTime<Utc>) -> Self {
        let since_epoch = utc.signed_duration_since(gps_epoch());
        let whole = since_epoch.num_seconds();
        let nanos = (since_epoch - chrono::Duration::seconds(whole))
            .num_nanoseconds()
            .unwrap_or(0);
        Self::new(whole + GPS_UTC_LEAP_SECONDS, nanos as f64 * 1e-9)
    }

    pub fn whole_seconds(&self) -> i64 {
        self.sec
    }

    pub fn fraction(&self) -> f64 {
        self.frac
    }

    pub fn week(&self) -> i32 {
        self.sec.div_euclid(SECONDS_PER_WEEK) as i32
    }

    /// Time of week (seconds)
    pub fn tow(&self) -> f64 {
        self.sec.rem_euclid(SECONDS_PER_WEEK) as f64 + self.frac
    }

    pub fn is_finite(&self) -> bool {
        self.frac.is_finite()
    }
}

fn gps_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

impl Add<f64> for GnssTime {
    type Output = GnssTime;

    fn add(self, seconds: f64) -> GnssTime {
        let whole = seconds.trunc();
        GnssTime::new(self.sec + whole as i64, self.frac + (seconds - whole))
    }
}

impl Sub<f64> for GnssTime {
    type Output = GnssTime;

    fn sub(self, seconds: f64) -> GnssTime {
        self + (-seconds)
    }
}

impl Sub<GnssTime> for GnssTime {
    type Output = f64;

    /// Difference in seconds; the integer parts are subtracted exactly first
    fn sub(self, other: GnssTime) -> f64 {
        (self.sec - other.sec) as f64 + (self.frac - other.frac)
    }
}

impl PartialEq for GnssTime {
    fn eq(&self, other: &Self) -> bool {
        self.sec == other.sec && self.frac == other.frac
    }
}

impl PartialOrd for GnssTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.sec.cmp(&other.sec) {
            Ordering::Equal => self.frac.partial_cmp(&other.frac),
            ord => Some(ord),
        }
    }
}

impl fmt::Display for GnssTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:.9}", self.week(), self.tow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_week_tow_roundtrip() {
        let t = GnssTime::from_week_tow(2200, 345_600.25);
        assert_eq!(t.week(), 2200);
        assert!((t.tow() - 345_600.25).abs() < 1e-12);
    }

    #[test]
    fn test_sub_microsecond_resolution_after_days() {
        let start = GnssTime::from_week_tow(2300, 0.0);
        let later = start + 3.0 * 86_400.0 + 1.5e-7;
        let dt = later - start;
        assert!((dt - (259_200.0 + 1.5e-7)).abs() < 1e-9);
        let later_back = later - 259_200.0;
        assert!(((later_back - start) - 1.5e-7).abs() < 1e-10);
    }

    #[test]
    fn test_negative_offsets_normalize() {
        let t = GnssTime::new(100, 0.25) + (-0.5);
        assert_eq!(t.whole_seconds(), 99);
        assert!((t.fraction() - 0.75).abs() < 1e-15);
        assert!(t < GnssTime::new(100, 0.0));
    }

    #[test]
    fn test_from_utc_applies_leap_seconds() {
        let utc = Utc.with_ymd_and_hms(1980, 1, 13, 0, 0, 0).single().unwrap();
        let t = GnssTime::from_utc(utc);
        assert_eq!(t.week(), 1);
        assert!((t.tow() - GPS_UTC_LEAP_SECONDS as f64).abs() < 1e-12);
    }
}
