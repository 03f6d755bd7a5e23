//! Fixed delays between boot stages

use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};
use std::time::Duration;

/// Why a delay may have been shorter than asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SleepError {
    #[error("clock_gettime failed: {0}")]
    ClockRead(nix::Error),
    #[error("clock_nanosleep failed: {0}")]
    Sleep(nix::Error),
}

/// Sleep until `delay` past the current monotonic time.
///
/// The outcome is returned rather than logged because the first delay runs
/// before there is a console to report it on.
pub fn settle(delay: Duration) -> Result<(), SleepError> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(SleepError::ClockRead)?;
    let deadline = now + TimeSpec::from_duration(delay);
    clock_nanosleep(
        ClockId::CLOCK_MONOTONIC,
        ClockNanosleepFlags::TIMER_ABSTIME,
        &deadline,
    )
    .map_err(SleepError::Sleep)?;
    Ok(())
}

/// Log a delay that went wrong. Never fatal.
pub fn report(result: Result<(), SleepError>) {
    if let Err(e) = result {
        log::warn!("{}", e);
        println!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_settle_waits_at_least_the_delay() {
        let start = Instant::now();
        settle(Duration::from_millis(30)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_zero_delay_returns() {
        assert!(settle(Duration::ZERO).is_ok());
    }
}
