//! Update window computation.
//!
//! A weekly timetable is an allow-list of time slots per ISO day of week.
//! [`available_time`] answers the only question update gating needs: how
//! long from a given instant until an update is permitted. Zero means the
//! instant is already inside a window.
//!
//! # Invariants
//!
//! - `available_time(t, tt) == 0` iff `t` lies inside a slot of `tt`.
//! - The result never exceeds one week for a valid timetable.
//! - Validation rejects a timetable before any scanning happens, so a
//!   malformed entry can never silently shrink the schedule.

use chrono::{Datelike, Days, NaiveDateTime};
use std::time::Duration;
use thiserror::Error;

use convoy_cloudproto::{TimeSlot, TimetableEntry};

/// Timetable validation and computation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("timetable is empty")]
    EmptyTimetable,

    #[error("invalid day of week value")]
    InvalidDayOfWeek,

    #[error("no time slots")]
    NoTimeSlots,

    #[error("start value should contain only time")]
    StartHasDatePart,

    #[error("finish value should contain only time")]
    FinishHasDatePart,

    #[error("start value should be before finish value")]
    StartNotBeforeFinish,

    #[error("no available time slot")]
    NoAvailableSlot,
}

/// Validate a timetable without computing anything.
pub fn validate_timetable(timetable: &[TimetableEntry]) -> Result<(), ScheduleError> {
    if timetable.is_empty() {
        return Err(ScheduleError::EmptyTimetable);
    }

    for entry in timetable {
        if !(1..=7).contains(&entry.day_of_week) {
            return Err(ScheduleError::InvalidDayOfWeek);
        }

        if entry.time_slots.is_empty() {
            return Err(ScheduleError::NoTimeSlots);
        }

        for slot in &entry.time_slots {
            validate_slot(slot)?;
        }
    }

    Ok(())
}

fn validate_slot(slot: &TimeSlot) -> Result<(), ScheduleError> {
    if slot.start.has_date_part() {
        return Err(ScheduleError::StartHasDatePart);
    }

    if slot.finish.has_date_part() {
        return Err(ScheduleError::FinishHasDatePart);
    }

    if slot.start.time() >= slot.finish.time() {
        return Err(ScheduleError::StartNotBeforeFinish);
    }

    Ok(())
}

/// Duration from `from` until the next permitted window of `timetable`.
///
/// Returns zero when `from` is already inside a slot, otherwise the time
/// until the nearest future slot start, scanning day by day and wrapping
/// the week boundary.
pub fn available_time(
    from: NaiveDateTime,
    timetable: &[TimetableEntry],
) -> Result<Duration, ScheduleError> {
    validate_timetable(timetable)?;

    let mut nearest: Option<chrono::Duration> = None;

    // Offset 7 covers slots earlier today that recur next week.
    for offset in 0u64..=7 {
        let Some(day) = from.date().checked_add_days(Days::new(offset)) else {
            continue;
        };
        let day_of_week = day.weekday().number_from_monday();

        for entry in timetable {
            if entry.day_of_week != day_of_week {
                continue;
            }

            for slot in &entry.time_slots {
                let start = day.and_time(slot.start.time());
                let finish = day.and_time(slot.finish.time());

                if offset == 0 && start <= from && from < finish {
                    return Ok(Duration::ZERO);
                }

                if start > from {
                    let wait = start - from;
                    if nearest.is_none_or(|current| wait < current) {
                        nearest = Some(wait);
                    }
                }
            }
        }
    }

    nearest
        .and_then(|wait| wait.to_std().ok())
        .ok_or(ScheduleError::NoAvailableSlot)
}
