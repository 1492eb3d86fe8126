//! Autopilot timestamp localization
//!
//! Some firmware reports absolute wall-clock time, other firmware reports
//! time since boot. Values above [`FIVE_YEARS_US`] are taken as absolute.

/// One (non-leap) year in microseconds
pub const YEAR_US: i64 = 365 * 24 * 3600 * 1_000_000;

/// Threshold above which a timestamp is treated as absolute epoch time
pub const FIVE_YEARS_US: i64 = 5 * YEAR_US;

/// Normalize an autopilot timestamp to session-relative time.
pub fn localize_time_us(time_us: i64, start_epoch_us: i64) -> i64 {
    localize_time_us_with_threshold(time_us, start_epoch_us, FIVE_YEARS_US)
}

/// Same as [`localize_time_us`] with an explicit absolute-time threshold.
pub fn localize_time_us_with_threshold(time_us: i64, start_epoch_us: i64, threshold_us: i64) -> i64 {
    if time_us > threshold_us {
        time_us - start_epoch_us
    } else {
        time_us
    }
}
