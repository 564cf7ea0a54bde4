//! Schedule derivation from source metadata.
//!
//! Pure and deterministic: the same source metadata and failure count
//! always produce the same schedule parameters.

use crate::models::{IntervalType, SourcePriority};
use chrono::Duration;

/// Interval bounds in minutes. Backoff saturates at the upper bound.
pub const MIN_INTERVAL_MINUTES: i64 = 1;
pub const MAX_INTERVAL_MINUTES: i64 = 1440;

/// Derived schedule parameters for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleParams {
    pub interval_minutes: i64,
    pub interval_type: IntervalType,
    pub numeric_priority: i32,
    /// Stagger applied to the first run after job creation.
    pub initial_delay: Duration,
}

/// Compute schedule parameters from source metadata.
///
/// Adjustments apply in order: priority base, rate-limit factor, depth
/// factor, failure backoff. All factor math is truncating integer
/// arithmetic. This function never errors.
pub fn compute_schedule(
    rate_limit: i32,
    max_depth: i32,
    priority: SourcePriority,
    failure_count: i32,
) -> ScheduleParams {
    let mut minutes: i64 = match priority {
        SourcePriority::Critical => 15,
        SourcePriority::High => 30,
        SourcePriority::Normal => 60,
        SourcePriority::Low => 180,
    };

    let rate_limit = if rate_limit <= 0 { 10 } else { rate_limit };
    minutes = match rate_limit {
        r if r <= 5 => minutes * 3 / 2,
        r if r <= 10 => minutes,
        r if r <= 20 => minutes * 3 / 4,
        _ => minutes / 2,
    };

    let max_depth = if max_depth <= 0 { 1 } else { max_depth };
    minutes = match max_depth {
        d if d <= 2 => minutes,
        d if d <= 5 => minutes * 5 / 4,
        _ => minutes * 3 / 2,
    };

    // Iterative doubling with early exit; pow(2, n) would overflow at
    // large failure counts.
    if failure_count > 0 {
        for _ in 0..failure_count {
            minutes *= 2;
            if minutes >= MAX_INTERVAL_MINUTES {
                minutes = MAX_INTERVAL_MINUTES;
                break;
            }
        }
    }

    let minutes = minutes.clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES);

    let interval_type = if minutes % 60 == 0 {
        IntervalType::Hours
    } else {
        IntervalType::Minutes
    };

    let numeric_priority = match priority {
        SourcePriority::Critical => 100,
        SourcePriority::High => 75,
        SourcePriority::Normal => 50,
        SourcePriority::Low => 25,
    };

    let initial_delay = match priority {
        SourcePriority::Critical => Duration::zero(),
        SourcePriority::High => Duration::minutes(1),
        SourcePriority::Normal => Duration::minutes(5),
        SourcePriority::Low => Duration::minutes(10),
    };

    ScheduleParams {
        interval_minutes: minutes,
        interval_type,
        numeric_priority,
        initial_delay,
    }
}
