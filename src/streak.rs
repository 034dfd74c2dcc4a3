use chrono::{DateTime, Duration, Utc};

pub const STREAK_BONUS_PER_DAY: u32 = 5;
pub const MAX_STREAK_BONUS: f64 = 100.0;

/// Next streak value given the previous activity time.
///
/// A gap of 24h up to (but excluding) 48h leaves the streak untouched: it is
/// neither extended nor broken.
pub fn advance_streak(last_activity: Option<DateTime<Utc>>, now: DateTime<Utc>, streak: u32) -> u32 {
    let Some(last) = last_activity else {
        return 1;
    };

    let gap = now - last;
    if gap >= Duration::hours(48) {
        1
    } else if gap < Duration::hours(24) {
        streak.saturating_add(1)
    } else {
        streak
    }
}

pub fn streak_bonus(streak: u32) -> f64 {
    (streak.saturating_mul(STREAK_BONUS_PER_DAY) as f64).min(MAX_STREAK_BONUS)
}
