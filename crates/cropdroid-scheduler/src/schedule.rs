//! Recurrence matching for channel and workflow schedules.
//!
//! Everything is evaluated on the farm's local calendar. With a positive
//! duration the schedule is on during `[occurrence, occurrence + duration)`,
//! where an occurrence is the start time-of-day on a matching date. With no
//! duration the schedule is on for the whole of each matching date inside
//! `[start_date, end_date)`.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::model::{Frequency, Schedule};

const DAY_SECS: i64 = 86_400;

fn invalid(schedule: &Schedule, reason: impl Into<String>) -> CropDroidError {
    CropDroidError::ScheduleInvalid {
        schedule_id: schedule.id,
        reason: reason.into(),
    }
}

/// Reject schedules no date could ever match.
pub fn validate(schedule: &Schedule) -> Result<()> {
    if schedule.frequency == Frequency::Weekly && schedule.days & 0x7f == 0 {
        return Err(invalid(schedule, "weekly schedule has an empty day mask"));
    }
    if let Some(end) = schedule.end_date {
        if end < schedule.start_date {
            return Err(invalid(schedule, "end_date precedes start_date"));
        }
    }
    Ok(())
}

/// Bit of `date`'s weekday in the Sunday-first day mask.
fn weekday_bit(date: NaiveDate) -> u8 {
    1 << date.weekday().num_days_from_sunday()
}

fn interval(schedule: &Schedule) -> i64 {
    schedule.interval.max(1) as i64
}

/// Does `date` carry an occurrence, ignoring `count`?
fn date_matches(schedule: &Schedule, start: NaiveDate, date: NaiveDate) -> bool {
    if date < start {
        return false;
    }
    let n = interval(schedule);
    match schedule.frequency {
        Frequency::Once => date == start,
        Frequency::Daily => {
            let days = (date - start).num_days();
            days % n == 0 && (schedule.days == 0 || schedule.days & weekday_bit(date) != 0)
        }
        Frequency::Weekly => {
            // Weeks counted from the Sunday on or before the start date.
            let week0 = start - Duration::days(start.weekday().num_days_from_sunday() as i64);
            let weeks = (date - week0).num_days() / 7;
            weeks % n == 0 && schedule.days & weekday_bit(date) != 0
        }
        Frequency::Monthly => {
            let months = (date.year() as i64 * 12 + date.month0() as i64)
                - (start.year() as i64 * 12 + start.month0() as i64);
            date.day() == start.day() && months % n == 0
        }
        Frequency::Yearly => {
            let years = (date.year() - start.year()) as i64;
            date.month() == start.month() && date.day() == start.day() && years % n == 0
        }
    }
}

/// Zero-based index of the occurrence on `date`, stopping early once `cap`
/// is reached.
fn occurrence_index(schedule: &Schedule, start: NaiveDate, date: NaiveDate, cap: u32) -> u32 {
    let mut index = 0u32;
    let mut d = start;
    while d < date && index < cap {
        if date_matches(schedule, start, d) {
            index += 1;
        }
        match d.succ_opt() {
            Some(next) => d = next,
            None => break,
        }
    }
    index
}

fn within_count(schedule: &Schedule, start: NaiveDate, date: NaiveDate) -> bool {
    schedule.count == 0 || occurrence_index(schedule, start, date, schedule.count) < schedule.count
}

/// Resolve a local wall time, moving forward out of a DST gap.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc)),
    }
}

/// Is the schedule's on-window open at `now`?
pub fn is_active(schedule: &Schedule, duration_secs: u64, now: DateTime<Utc>, tz: Tz) -> Result<bool> {
    validate(schedule)?;
    if now < schedule.start_date {
        return Ok(false);
    }
    let start_local = schedule.start_date.with_timezone(&tz);
    let start_day = start_local.date_naive();
    let now_local = now.with_timezone(&tz);

    if duration_secs == 0 {
        if schedule.end_date.is_some_and(|end| now >= end) {
            return Ok(false);
        }
        let today = now_local.date_naive();
        return Ok(date_matches(schedule, start_day, today) && within_count(schedule, start_day, today));
    }

    if schedule.frequency == Frequency::Once {
        let end = schedule.start_date + Duration::seconds(duration_secs as i64);
        return Ok(now < end);
    }

    // Any occurrence that can still cover `now` started at most this many days ago.
    let lookback = (duration_secs as i64 + DAY_SECS - 1) / DAY_SECS;
    let time_of_day = start_local.time();
    for back in 0..=lookback {
        let date = now_local.date_naive() - Duration::days(back);
        if !date_matches(schedule, start_day, date) {
            continue;
        }
        let Some(occurrence) = resolve_local(tz, date.and_time(time_of_day)) else {
            continue;
        };
        if occurrence > now || occurrence < schedule.start_date {
            continue;
        }
        if schedule.end_date.is_some_and(|end| occurrence > end) {
            continue;
        }
        if !within_count(schedule, start_day, date) {
            continue;
        }
        if now < occurrence + Duration::seconds(duration_secs as i64) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropdroid_core::model::days;

    fn schedule(start: DateTime<Utc>, frequency: Frequency) -> Schedule {
        Schedule {
            id: 1,
            channel_id: Some(1),
            workflow_id: None,
            start_date: start,
            end_date: None,
            frequency,
            interval: 1,
            count: 0,
            days: 0,
        }
    }

    fn ny(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        chrono_tz::America::New_York
            .with_ymd_and_hms(y, m, d, h, mi, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_daily_light_cycle() {
        let tz = chrono_tz::America::New_York;
        let s = schedule(ny(2026, 4, 10, 19, 0, 0), Frequency::Daily);
        let eighteen_hours = 64_800;
        assert!(is_active(&s, eighteen_hours, ny(2026, 4, 10, 19, 0, 0), tz).unwrap());
        assert!(is_active(&s, eighteen_hours, ny(2026, 4, 11, 12, 59, 59), tz).unwrap());
        assert!(!is_active(&s, eighteen_hours, ny(2026, 4, 11, 13, 0, 0), tz).unwrap());
        assert!(!is_active(&s, eighteen_hours, ny(2026, 4, 11, 18, 59, 59), tz).unwrap());
        // Before the first occurrence.
        assert!(!is_active(&s, eighteen_hours, ny(2026, 4, 10, 8, 0, 0), tz).unwrap());
    }

    #[test]
    fn test_daily_across_dst_change() {
        let tz = chrono_tz::America::New_York;
        let s = schedule(ny(2026, 3, 1, 19, 0, 0), Frequency::Daily);
        // 2026-03-08 is the spring-forward date; 19:00 local still opens the window.
        assert!(is_active(&s, 3600, ny(2026, 3, 8, 19, 30, 0), tz).unwrap());
        assert!(!is_active(&s, 3600, ny(2026, 3, 8, 20, 0, 0), tz).unwrap());
    }

    #[test]
    fn test_weekly_day_mask() {
        let tz = chrono_tz::UTC;
        // 2026-06-01 is a Monday.
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).unwrap();
        let mut s = schedule(start, Frequency::Weekly);
        s.days = days::MO | days::TH;
        let at = |d: u32| Utc.with_ymd_and_hms(2026, 6, d, 6, 30, 0).unwrap();
        assert!(is_active(&s, 3600, at(1), tz).unwrap());
        assert!(!is_active(&s, 3600, at(2), tz).unwrap());
        assert!(is_active(&s, 3600, at(4), tz).unwrap());
        assert!(is_active(&s, 3600, at(8), tz).unwrap());

        s.interval = 2;
        assert!(!is_active(&s, 3600, at(8), tz).unwrap());
        assert!(is_active(&s, 3600, at(15), tz).unwrap());
    }

    #[test]
    fn test_weekly_empty_mask_invalid() {
        let s = schedule(Utc::now(), Frequency::Weekly);
        let err = is_active(&s, 60, Utc::now(), chrono_tz::UTC).unwrap_err();
        assert!(matches!(err, CropDroidError::ScheduleInvalid { .. }));
    }

    #[test]
    fn test_monthly_and_yearly() {
        let tz = chrono_tz::UTC;
        let start = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap();
        let monthly = schedule(start, Frequency::Monthly);
        assert!(is_active(&monthly, 600, Utc.with_ymd_and_hms(2026, 3, 15, 9, 5, 0).unwrap(), tz).unwrap());
        assert!(!is_active(&monthly, 600, Utc.with_ymd_and_hms(2026, 3, 16, 9, 5, 0).unwrap(), tz).unwrap());

        let yearly = schedule(start, Frequency::Yearly);
        assert!(is_active(&yearly, 600, Utc.with_ymd_and_hms(2027, 1, 15, 9, 5, 0).unwrap(), tz).unwrap());
        assert!(!is_active(&yearly, 600, Utc.with_ymd_and_hms(2027, 2, 15, 9, 5, 0).unwrap(), tz).unwrap());
    }

    #[test]
    fn test_count_caps_occurrences() {
        let tz = chrono_tz::UTC;
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
        let mut s = schedule(start, Frequency::Daily);
        s.count = 3;
        let at = |d: u32| Utc.with_ymd_and_hms(2026, 2, d, 8, 1, 0).unwrap();
        assert!(is_active(&s, 120, at(3), tz).unwrap());
        assert!(!is_active(&s, 120, at(4), tz).unwrap());
    }

    #[test]
    fn test_once_and_end_date() {
        let tz = chrono_tz::UTC;
        let start = Utc.with_ymd_and_hms(2026, 7, 4, 12, 0, 0).unwrap();
        let once = schedule(start, Frequency::Once);
        assert!(is_active(&once, 60, start + Duration::seconds(59), tz).unwrap());
        assert!(!is_active(&once, 60, start + Duration::seconds(60), tz).unwrap());
        assert!(!is_active(&once, 60, start + Duration::days(1), tz).unwrap());

        let mut bounded = schedule(start, Frequency::Daily);
        bounded.end_date = Some(start + Duration::days(2));
        assert!(is_active(&bounded, 0, start + Duration::hours(30), tz).unwrap());
        assert!(!is_active(&bounded, 0, start + Duration::days(3), tz).unwrap());
    }
}
