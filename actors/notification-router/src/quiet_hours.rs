//! Do-not-disturb evaluation in the user's local clock

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use routing_common::{parse_timezone, QuietHours, ValidationError, ValidationResult};

const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, Default)]
pub struct QuietHoursGate;

impl QuietHoursGate {
    pub fn new() -> Self {
        Self
    }

    /// Whether `now` falls inside the window, both ends inclusive.
    ///
    /// A window whose start is after its end spans midnight.
    pub fn is_quiet(
        &self,
        quiet_hours: Option<&QuietHours>,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> ValidationResult<bool> {
        let Some(quiet_hours) = quiet_hours else {
            return Ok(false);
        };

        let tz = parse_timezone(timezone)?;
        let start = quiet_hours.start_minute()?;
        let end = quiet_hours.end_minute()?;
        let local = now.with_timezone(&tz);
        let minute = (local.hour() * 60 + local.minute()) as u16;

        Ok(within(start, end, minute))
    }

    /// UTC instant of the first minute after the current window ends, or
    /// `None` when `now` is not quiet
    pub fn quiet_until(
        &self,
        quiet_hours: Option<&QuietHours>,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> ValidationResult<Option<DateTime<Utc>>> {
        if !self.is_quiet(quiet_hours, timezone, now)? {
            return Ok(None);
        }
        let Some(quiet_hours) = quiet_hours else {
            return Ok(None);
        };

        let tz = parse_timezone(timezone)?;
        let reopen = (quiet_hours.end_minute()? + 1) % MINUTES_PER_DAY;
        let local_now = now.with_timezone(&tz).naive_local();

        let mut date = local_now.date();
        let mut candidate = at_minute(date, reopen)?;
        if candidate <= local_now {
            date = date.succ_opt().ok_or_else(|| out_of_range(date))?;
            candidate = at_minute(date, reopen)?;
        }

        Ok(Some(local_to_utc(&tz, candidate)))
    }
}

fn within(start: u16, end: u16, minute: u16) -> bool {
    if start <= end {
        start <= minute && minute <= end
    } else {
        minute >= start || minute <= end
    }
}

fn at_minute(date: NaiveDate, minute_of_day: u16) -> ValidationResult<NaiveDateTime> {
    let time = NaiveTime::from_hms_opt(u32::from(minute_of_day / 60), u32::from(minute_of_day % 60), 0)
        .ok_or_else(|| ValidationError::InvalidTimeFormat(format!("minute {} out of range", minute_of_day)))?;
    Ok(date.and_time(time))
}

fn out_of_range(date: NaiveDate) -> ValidationError {
    ValidationError::InvalidParameter {
        field: "date".to_string(),
        reason: format!("{} has no following day", date),
    }
}

/// Resolve a local wall-clock time to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// spring-forward gap are pushed forward by the gap.
pub fn local_to_utc(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = local + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) => dt.with_timezone(&Utc),
                LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
                LocalResult::None => Utc.from_utc_datetime(&local),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use routing_common::test_utilities::utc_at;

    fn overnight() -> QuietHours {
        QuietHours::new("22:00", "08:00")
    }

    #[test]
    fn test_midnight_span() {
        let gate = QuietHoursGate::new();
        let qh = overnight();
        assert!(gate.is_quiet(Some(&qh), "UTC", utc_at(23, 0)).unwrap());
        assert!(gate.is_quiet(Some(&qh), "UTC", utc_at(3, 0)).unwrap());
        assert!(!gate.is_quiet(Some(&qh), "UTC", utc_at(9, 0)).unwrap());
        assert!(!gate.is_quiet(Some(&qh), "UTC", utc_at(21, 59)).unwrap());
        // Both ends inclusive
        assert!(gate.is_quiet(Some(&qh), "UTC", utc_at(22, 0)).unwrap());
        assert!(gate.is_quiet(Some(&qh), "UTC", utc_at(8, 0)).unwrap());
        assert!(!gate.is_quiet(Some(&qh), "UTC", utc_at(8, 1)).unwrap());
    }

    #[test]
    fn test_same_day_window() {
        let gate = QuietHoursGate::new();
        let qh = QuietHours::new("12:00", "13:30");
        assert!(gate.is_quiet(Some(&qh), "UTC", utc_at(12, 45)).unwrap());
        assert!(!gate.is_quiet(Some(&qh), "UTC", utc_at(13, 31)).unwrap());
        assert!(!gate.is_quiet(Some(&qh), "UTC", utc_at(11, 59)).unwrap());
    }

    #[test]
    fn test_absent_window_is_never_quiet() {
        let gate = QuietHoursGate::new();
        assert!(!gate.is_quiet(None, "UTC", utc_at(3, 0)).unwrap());
        assert_eq!(gate.quiet_until(None, "UTC", utc_at(3, 0)).unwrap(), None);
    }

    #[test]
    fn test_evaluated_in_user_timezone() {
        let gate = QuietHoursGate::new();
        let qh = overnight();
        // 2024-03-15 04:00 UTC is 00:00 in New York (EDT, UTC-4)
        assert!(gate.is_quiet(Some(&qh), "America/New_York", utc_at(4, 0)).unwrap());
        // 2024-03-15 14:00 UTC is 10:00 in New York
        assert!(!gate.is_quiet(Some(&qh), "America/New_York", utc_at(14, 0)).unwrap());
    }

    #[test]
    fn test_unknown_timezone_is_rejected() {
        let gate = QuietHoursGate::new();
        let err = gate
            .is_quiet(Some(&overnight()), "Atlantis/Capital", utc_at(3, 0))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTimezone(_)));
    }

    #[test]
    fn test_quiet_until_rolls_over_midnight() {
        let gate = QuietHoursGate::new();
        let qh = overnight();
        let until = gate.quiet_until(Some(&qh), "UTC", utc_at(23, 30)).unwrap();
        assert_eq!(until, Some(utc_at(8, 1) + Duration::days(1)));

        let until = gate.quiet_until(Some(&qh), "UTC", utc_at(3, 0)).unwrap();
        assert_eq!(until, Some(utc_at(8, 1)));

        assert_eq!(gate.quiet_until(Some(&qh), "UTC", utc_at(12, 0)).unwrap(), None);
    }

    #[test]
    fn test_local_to_utc_skips_dst_gap() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2024-03-10 02:30 does not exist in New York
        let gap = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();
        let resolved = local_to_utc(&tz, gap);
        assert_eq!(resolved, Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap());
    }
}
