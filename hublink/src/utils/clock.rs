use std::time::Instant;

/// Source of the timestamps used for device state-change timeouts.
///
/// `None` means the current time cannot be determined. Timeout checks treat an
/// indefinite reading as a failure instead of skipping the check, so a broken
/// clock degrades into device errors rather than devices hanging forever in a
/// transitional state.
pub trait Clock {
    fn now(&self) -> Option<Instant>;
}

/// The default clock, backed by [`Instant::now`].
///
/// `Instant` is monotonic, so wall-clock jumps cannot corrupt elapsed-time
/// decisions.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Option<Instant> {
        Some(Instant::now())
    }
}
