use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::trace;
use crate::sleep::SleepEvent;

/// A delay owed to a display after a command, waited out lazily before
/// the next command is sent.
///
/// Time spent by the caller between commands counts towards the delay.
#[derive(Clone, Debug, Default)]
pub struct Delay {
    deadline: Option<Instant>,
    event: Option<SleepEvent>,
}

impl Delay {
    /// Creates a new delay starting now.
    pub fn new(event: SleepEvent, delay: Duration) -> Self {
        Delay {
            deadline: Instant::now().checked_add(delay),
            event: Some(event),
        }
    }

    /// The event the delay was created for.
    pub fn event(&self) -> Option<SleepEvent> {
        self.event
    }

    /// The time remaining in this delay.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .and_then(|deadline| deadline.checked_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Waits out the remaining time in this delay.
    pub fn sleep(&mut self) {
        let remaining = self.remaining();
        self.deadline = None;
        if remaining > Duration::from_secs(0) {
            trace!(event = ?self.event, ?remaining, "waiting out command delay");
            sleep(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delay_is_elapsed() {
        let mut delay = Delay::default();
        assert_eq!(delay.remaining(), Duration::from_secs(0));
        delay.sleep();
    }

    #[test]
    fn sleep_consumes_delay() {
        let mut delay = Delay::new(SleepEvent::PostRead, Duration::from_millis(5));
        assert!(delay.remaining() <= Duration::from_millis(5));
        delay.sleep();
        assert_eq!(delay.remaining(), Duration::from_secs(0));
        assert_eq!(delay.event(), Some(SleepEvent::PostRead));
    }
}
