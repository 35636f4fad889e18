use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    error::{NagareError, NagareResult},
    hls::m3u8::parse_date,
};

// Years and months have no fixed length; their nominal one is used.
const SECONDS_PER_YEAR: f64 = 365. * 86400.;
const SECONDS_PER_MONTH: f64 = 30. * 86400.;

/// Parses an `xs:duration` such as `PT1H2M3.5S` or `P1DT12H`.
pub fn parse_duration(value: &str) -> NagareResult<Duration> {
    let invalid = || NagareError::MpdParseError(format!("invalid duration: {value:?}"));

    let value = value.trim();
    if value == "P" || value.ends_with('T') {
        return Err(invalid());
    }
    let iso = iso8601_duration::Duration::parse(value).map_err(|_| invalid())?;

    let seconds = f64::from(iso.year) * SECONDS_PER_YEAR
        + f64::from(iso.month) * SECONDS_PER_MONTH
        + f64::from(iso.day) * 86400.
        + f64::from(iso.hour) * 3600.
        + f64::from(iso.minute) * 60.
        + f64::from(iso.second);
    if !seconds.is_finite() || seconds < 0. {
        return Err(invalid());
    }
    // components are single precision, keep microseconds only
    Ok(Duration::from_micros((seconds * 1e6).round() as u64))
}

/// Parses an `xs:dateTime`. A value without a timezone is taken as UTC.
pub fn parse_datetime(value: &str) -> NagareResult<DateTime<Utc>> {
    parse_date(value)
        .ok_or_else(|| NagareError::MpdParseError(format!("invalid date time: {value:?}")))
}
