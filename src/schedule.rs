use chrono::{DateTime, Duration, Utc};

/// Where `now` falls relative to one scheduled class meeting. Derived on
/// demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindowStatus {
    Upcoming,
    OnTime,
    LateWindow,
    Completed,
}

/// Upper bound the IPC surface accepts for a late threshold; one full day
/// already exceeds any real class meeting.
pub const MAX_LATE_THRESHOLD_MINUTES: i64 = 24 * 60;

impl TimeWindowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeWindowStatus::Upcoming => "upcoming",
            TimeWindowStatus::OnTime => "on_time",
            TimeWindowStatus::LateWindow => "late_window",
            TimeWindowStatus::Completed => "completed",
        }
    }

    /// Attendance collection may only start while the class is running.
    pub fn allows_opening(self) -> bool {
        matches!(self, TimeWindowStatus::OnTime | TimeWindowStatus::LateWindow)
    }
}

impl std::fmt::Display for TimeWindowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify `now` against a class meeting's schedule.
///
/// Boundaries are inclusive on the side of the earlier phase: a student
/// arriving exactly at `start + late_threshold` is still on time, and the
/// late window runs through `scheduled_end` itself.
pub fn classify(
    now: DateTime<Utc>,
    scheduled_start: DateTime<Utc>,
    scheduled_end: DateTime<Utc>,
    late_threshold_minutes: i64,
) -> TimeWindowStatus {
    if now < scheduled_start {
        return TimeWindowStatus::Upcoming;
    }
    if now > scheduled_end {
        return TimeWindowStatus::Completed;
    }
    // A threshold past what the clock can represent covers the whole meeting.
    let late_from = Duration::try_minutes(late_threshold_minutes.max(0))
        .and_then(|d| scheduled_start.checked_add_signed(d))
        .unwrap_or(scheduled_end);
    if now <= late_from {
        TimeWindowStatus::OnTime
    } else {
        TimeWindowStatus::LateWindow
    }
}
