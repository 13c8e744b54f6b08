use std::time::Duration;
use std::fmt;
use crate::transport::DisplayPath;

/// Points in a DDC/CI exchange where the protocol requires the host to wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SleepEvent {
    /// Between writing a request and reading its reply.
    WriteToRead,
    /// After a write-only command such as Set VCP Feature.
    PostWrite,
    /// After a reply has been read, before the next command.
    PostRead,
    /// After Save Current Settings.
    PostSaveSettings,
    /// After a command failed, before the next attempt.
    CommandFailed,
}

impl SleepEvent {
    /// The delay the DDC/CI specification prescribes for this event.
    pub fn base_delay(self) -> Duration {
        Duration::from_millis(match self {
            SleepEvent::WriteToRead => 40,
            SleepEvent::PostWrite => 50,
            // not given for reads; 50 matches every other command
            SleepEvent::PostRead => 50,
            SleepEvent::PostSaveSettings => 200,
            SleepEvent::CommandFailed => 40,
        })
    }
}

impl fmt::Display for SleepEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            SleepEvent::WriteToRead => "write-to-read",
            SleepEvent::PostWrite => "post-write",
            SleepEvent::PostRead => "post-read",
            SleepEvent::PostSaveSettings => "post-save-settings",
            SleepEvent::CommandFailed => "command-failed",
        };
        f.write_str(name)
    }
}

/// Decides how long to wait at each [`SleepEvent`] for a given display.
///
/// The retry engine reports outcomes back through this trait so that an
/// implementation can adapt its delays to how reliably a display answers.
pub trait SleepPolicy: Send + Sync {
    /// Called once at the start of every exchange.
    fn begin_exchange(&self, display: &DisplayPath);

    /// Records the outcome of a single try.
    fn record_outcome(&self, display: &DisplayPath, ok: bool);

    /// Called before retrying after a retryable failure within an exchange.
    fn note_retry(&self, display: &DisplayPath);

    /// The delay to apply for `event` on `display`.
    fn adjusted_delay(&self, display: &DisplayPath, event: SleepEvent) -> Duration;
}

/// Scales a base delay by a floating point factor.
pub(crate) fn scale(base: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || !factor.is_finite() {
        return base
    }
    Duration::from_nanos((base.as_nanos() as f64 * factor).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_rejects_nonsense_factors() {
        let base = SleepEvent::WriteToRead.base_delay();
        assert_eq!(scale(base, 0.0), base);
        assert_eq!(scale(base, f64::NAN), base);
        assert_eq!(scale(base, 2.0), Duration::from_millis(80));
    }
}
