//! Local-time arithmetic for quiet hours, daily caps and daily rollups.
//!
//! All boundaries are computed in the configured IANA timezone and converted
//! back to UTC. Local times that do not exist (DST gaps) resolve to the first
//! valid instant after them.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use funnel_recovery_core::config::QuietHours;

fn resolve_local(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = local;
    // A DST gap is at most a couple of hours; step forward until the local time exists.
    for _ in 0..8 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                return dt.with_timezone(&Utc);
            }
            LocalResult::None => candidate += Duration::minutes(30),
        }
    }
    Utc.from_utc_datetime(&local)
}

/// Local calendar date of an instant.
#[must_use]
pub fn local_date(at: DateTime<Utc>, tz: Tz) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// UTC bounds `[start, end)` of a local calendar day.
#[must_use]
pub fn day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let next = date.succ_opt().unwrap_or(date);
    (
        resolve_local(tz, date.and_time(chrono::NaiveTime::MIN)),
        resolve_local(tz, next.and_time(chrono::NaiveTime::MIN)),
    )
}

/// Start of the local day after the one containing `at`.
#[must_use]
pub fn next_local_midnight(at: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    day_bounds(local_date(at, tz), tz).1
}

/// `at` itself when outside quiet hours, otherwise the end of the quiet window
/// that contains it.
#[must_use]
pub fn defer_past_quiet_hours(
    at: DateTime<Utc>,
    quiet: Option<QuietHours>,
    tz: Tz,
) -> DateTime<Utc> {
    let Some(quiet) = quiet else {
        return at;
    };
    let local = at.with_timezone(&tz).naive_local();
    if !quiet.contains(local.time()) {
        return at;
    }
    // For a window wrapping midnight, a time after the start ends tomorrow.
    let end_date = if quiet.start > quiet.end && local.time() >= quiet.start {
        local.date().succ_opt().unwrap_or(local.date())
    } else {
        local.date()
    };
    resolve_local(tz, end_date.and_time(quiet.end))
}
