//! Computes the next run time for a [`ScheduleConfig`].
//!
//! Grounded on `ai_task_manager.py::calculate_next_run`, with three corrections recorded
//! in DESIGN.md: `once` schedules whose `run_at` has already passed yield no next run
//! instead of scheduling instantly; `weekly` with an explicit empty `weekdays` list is
//! rejected as `InvalidSpec` rather than silently defaulting to Monday; `monthly` clamps
//! an out-of-range `day` to the last day of the target month instead of panicking.

use crate::error::SchedulerError;
use crate::model::ScheduleConfig;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

/// Pure function: given a schedule and the instant to compute "next" relative to,
/// return the next run time, or `None` if the schedule has no more occurrences.
pub fn next_run(
    config: &ScheduleConfig,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    match config {
        ScheduleConfig::Once { run_at } => {
            Ok(if *run_at > after { Some(*run_at) } else { None })
        }
        ScheduleConfig::Daily { hour, minute } => {
            Ok(Some(next_daily(after, *hour, *minute)?))
        }
        ScheduleConfig::Weekly {
            weekdays,
            hour,
            minute,
        } => {
            if weekdays.is_empty() {
                return Err(SchedulerError::InvalidSpec(
                    "weekly schedule requires at least one weekday".into(),
                ));
            }
            Ok(Some(next_weekly(after, weekdays, *hour, *minute)?))
        }
        ScheduleConfig::Monthly { day, hour, minute } => {
            Ok(Some(next_monthly(after, *day, *hour, *minute)?))
        }
        ScheduleConfig::Custom { interval_minutes } => {
            if *interval_minutes <= 0 {
                return Err(SchedulerError::InvalidSpec(
                    "custom schedule requires a positive interval_minutes".into(),
                ));
            }
            Ok(Some(after + Duration::minutes(*interval_minutes)))
        }
    }
}

fn time_of_day(hour: u32, minute: u32) -> Result<NaiveTime, SchedulerError> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| SchedulerError::InvalidSpec(format!("invalid time {hour:02}:{minute:02}")))
}

fn next_daily(after: DateTime<Utc>, hour: u32, minute: u32) -> Result<DateTime<Utc>, SchedulerError> {
    let time = time_of_day(hour, minute)?;
    let today = after.date_naive().and_time(time);
    let today_utc = Utc.from_utc_datetime(&today);
    Ok(if today_utc > after {
        today_utc
    } else {
        Utc.from_utc_datetime(&(after.date_naive() + Duration::days(1)).and_time(time))
    })
}

/// `weekday` uses ISO numbering with Monday = 0, matching the original Python
/// `datetime.weekday()` convention.
fn next_weekly(
    after: DateTime<Utc>,
    weekdays: &[u32],
    hour: u32,
    minute: u32,
) -> Result<DateTime<Utc>, SchedulerError> {
    let time = time_of_day(hour, minute)?;
    for offset in 0..=7 {
        let candidate_date = after.date_naive() + Duration::days(offset);
        let candidate_weekday = candidate_date.weekday().num_days_from_monday();
        if weekdays.contains(&candidate_weekday) {
            let candidate = Utc.from_utc_datetime(&candidate_date.and_time(time));
            if candidate > after {
                return Ok(candidate);
            }
        }
    }
    Err(SchedulerError::InvalidSpec(
        "weekly schedule has no reachable weekday".into(),
    ))
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap();
    (first_of_next - Duration::days(1)).day()
}

fn next_monthly(
    after: DateTime<Utc>,
    day: u32,
    hour: u32,
    minute: u32,
) -> Result<DateTime<Utc>, SchedulerError> {
    let time = time_of_day(hour, minute)?;
    let mut year = after.year();
    let mut month = after.month();

    for _ in 0..13 {
        let clamped_day = day.min(last_day_of_month(year, month));
        let candidate_date = NaiveDate::from_ymd_opt(year, month, clamped_day)
            .ok_or_else(|| SchedulerError::InvalidSpec("invalid monthly schedule day".into()))?;
        let candidate = Utc.from_utc_datetime(&candidate_date.and_time(time));
        if candidate > after {
            return Ok(candidate);
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    Err(SchedulerError::InvalidSpec(
        "monthly schedule did not resolve within a year".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn once_in_the_past_has_no_next_run() {
        let cfg = ScheduleConfig::Once {
            run_at: dt(2020, 1, 1, 0, 0),
        };
        let result = next_run(&cfg, dt(2025, 1, 1, 0, 0)).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn once_in_the_future_is_returned_verbatim() {
        let run_at = dt(2030, 1, 1, 9, 0);
        let cfg = ScheduleConfig::Once { run_at };
        let result = next_run(&cfg, dt(2025, 1, 1, 0, 0)).unwrap();
        assert_eq!(result, Some(run_at));
    }

    #[test]
    fn daily_rolls_to_tomorrow_after_the_time_has_passed() {
        let cfg = ScheduleConfig::Daily { hour: 9, minute: 0 };
        let after = dt(2025, 6, 1, 10, 0);
        let result = next_run(&cfg, after).unwrap().unwrap();
        assert_eq!(result, dt(2025, 6, 2, 9, 0));
    }

    #[test]
    fn weekly_with_empty_weekdays_is_rejected() {
        let cfg = ScheduleConfig::Weekly {
            weekdays: vec![],
            hour: 9,
            minute: 0,
        };
        let err = next_run(&cfg, dt(2025, 6, 1, 0, 0)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSpec(_)));
    }

    #[test]
    fn weekly_finds_the_next_matching_weekday() {
        // 2025-06-02 is a Monday (weekday 0).
        let cfg = ScheduleConfig::Weekly {
            weekdays: vec![2], // Wednesday
            hour: 9,
            minute: 0,
        };
        let result = next_run(&cfg, dt(2025, 6, 2, 0, 0)).unwrap().unwrap();
        assert_eq!(result, dt(2025, 6, 4, 9, 0));
    }

    #[test]
    fn monthly_day_31_clamps_in_february() {
        let cfg = ScheduleConfig::Monthly {
            day: 31,
            hour: 9,
            minute: 0,
        };
        let result = next_run(&cfg, dt(2025, 2, 1, 0, 0)).unwrap().unwrap();
        assert_eq!(result, dt(2025, 2, 28, 9, 0));
    }

    #[test]
    fn custom_interval_adds_minutes() {
        let cfg = ScheduleConfig::Custom {
            interval_minutes: 90,
        };
        let after = dt(2025, 6, 1, 10, 0);
        let result = next_run(&cfg, after).unwrap().unwrap();
        assert_eq!(result, dt(2025, 6, 1, 11, 30));
    }
}
