//! Sunrise and sunset computation

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone};

/// Today's sun times in local time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunTimes {
    pub sunrise: DateTime<Local>,
    pub sunset: DateTime<Local>,
}

/// Compute sunrise and sunset for `date` at the given coordinates.
///
/// Returns `None` only when the resulting timestamps cannot be expressed
/// in the local timezone (polar edge cases resolve to the solar transit,
/// which still converts).
pub fn sun_times(latitude: f64, longitude: f64, date: NaiveDate) -> Option<SunTimes> {
    let (rise, set) =
        sunrise::sunrise_sunset(latitude, longitude, date.year(), date.month(), date.day());

    let sunrise = Local.timestamp_opt(rise, 0).single()?;
    let sunset = Local.timestamp_opt(set, 0).single()?;
    Some(SunTimes { sunrise, sunset })
}
