//! Scalar unit conversions applied to decoded telemetry.
//!
//! Everything the crate emits is already normalized through these helpers, so
//! consumers never see raw FTMS units.

/// Miles per kilometre, as used for speed conversions
pub const MILES_PER_KILOMETER: f64 = 0.621_371_2;

/// Miles per metre, as used for distance conversions
pub const MILES_PER_METER: f64 = 0.000_621_371;

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Convert km/h to mph, rounded to one decimal
#[must_use]
pub fn kmh_to_mph(kmh: f64) -> f64 {
    round_to(kmh * MILES_PER_KILOMETER, 1)
}

/// Convert mph to km/h without rounding
///
/// Used when encoding target speeds, where the codec does its own rounding
/// to the 0.01 km/h wire resolution.
#[must_use]
pub fn mph_to_kmh(mph: f64) -> f64 {
    mph / MILES_PER_KILOMETER
}

/// Convert metres to miles, rounded to two decimals
#[must_use]
pub fn meters_to_miles(meters: u32) -> f64 {
    round_to(f64::from(meters) * MILES_PER_METER, 2)
}

/// Format a second count as `HH:MM:SS`
///
/// Clock-face arithmetic only: hours wrap at 24.
#[must_use]
pub fn format_elapsed(seconds: u32) -> String {
    let hours = (seconds / 3600) % 24;
    let minutes = (seconds / 60) % 60;
    let secs = seconds % 60;
    format!("{hours:02}:{minutes:02}:{secs:02}")
}
