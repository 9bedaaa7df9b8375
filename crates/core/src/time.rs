use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

/// A simple clock abstraction for deterministic time in services and tests.
#[derive(Debug, Clone, Copy, Default)]
pub enum Clock {
    #[default]
    Default,
    Fixed(DateTime<Utc>),
}

impl Clock {
    /// Returns a clock that uses the current system time.
    #[must_use]
    pub fn default_clock() -> Self {
        Self::Default
    }

    /// Returns a clock fixed at the given timestamp.
    #[must_use]
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self::Fixed(at)
    }

    /// Returns the current time according to the clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::Default => Utc::now(),
            Clock::Fixed(t) => *t,
        }
    }

    /// If this is a fixed clock, advance it by the given duration.
    ///
    /// Has no effect on `Clock::Default`.
    pub fn advance(&mut self, delta: Duration) {
        if let Clock::Fixed(t) = self {
            *t += delta;
        }
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool {
        matches!(self, Clock::Fixed(_))
    }
}

/// Monday (UTC) of the ISO week containing `at`.
///
/// Weekly XP accumulates within this window.
#[must_use]
pub fn week_start(at: DateTime<Utc>) -> NaiveDate {
    let date = at.date_naive();
    let offset = i64::from(date.weekday().num_days_from_monday());
    date - Duration::days(offset)
}

/// Deterministic timestamp for tests and examples (2023-11-14T22:13:20Z, a Tuesday).
pub const FIXED_TEST_TIMESTAMP: i64 = 1_700_000_000;

/// Returns a deterministic `DateTime<Utc>` for tests and doc examples.
///
/// # Panics
///
/// Panics if the fixed timestamp cannot be represented.
#[must_use]
pub fn fixed_now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(FIXED_TEST_TIMESTAMP, 0)
        .expect("fixed timestamp should be valid")
}

/// Returns a `Clock` fixed at the deterministic test timestamp.
#[must_use]
pub fn fixed_clock() -> Clock {
    Clock::fixed(fixed_now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let mut clock = fixed_clock();
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), fixed_now() + Duration::minutes(5));
    }

    #[test]
    fn default_clock_ignores_advance() {
        let mut clock = Clock::default_clock();
        clock.advance(Duration::days(365));
        assert!(!clock.is_fixed());
        assert!(clock.now() < Utc::now() + Duration::days(1));
    }

    #[test]
    fn week_start_is_previous_monday() {
        // fixed_now() is Tuesday 2023-11-14.
        let start = week_start(fixed_now());
        assert_eq!(start, NaiveDate::from_ymd_opt(2023, 11, 13).unwrap());

        let sunday = fixed_now() + Duration::days(5);
        assert_eq!(week_start(sunday), start);

        let next_monday = fixed_now() + Duration::days(6);
        assert_eq!(
            week_start(next_monday),
            NaiveDate::from_ymd_opt(2023, 11, 20).unwrap()
        );
    }
}
