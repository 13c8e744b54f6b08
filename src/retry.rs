//! Retry ceilings and the per-operation try histogram.

use std::fmt;
use crate::transport::DisplayPath;
use crate::Error;

/// Upper bound for every per-operation try ceiling.
pub const MAX_MAX_TRIES: u8 = 15;

/// Tries allowed for null responses on a display known to answer
/// unsupported features with the null message.
///
/// Independent of the operation's ceiling: repeated null responses there
/// are evidence the feature is absent, not that the bus is unreliable.
pub const MAX_NULL_RESPONSE_TRIES: u8 = 3;

/// The kinds of exchange with separately tunable retry ceilings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RetryOperation {
    /// A request with no reply.
    WriteOnly,
    /// A request followed by reading its reply.
    WriteRead,
    /// A sequence of write-read fragments, such as the capabilities string.
    MultiPartRead,
    /// A sequence of write-only fragments.
    MultiPartWrite,
}

impl RetryOperation {
    /// Every operation type.
    pub const ALL: [RetryOperation; 4] = [
        RetryOperation::WriteOnly,
        RetryOperation::WriteRead,
        RetryOperation::MultiPartRead,
        RetryOperation::MultiPartWrite,
    ];

    /// Position of the operation in per-operation tables.
    pub fn index(self) -> usize {
        match self {
            RetryOperation::WriteOnly => 0,
            RetryOperation::WriteRead => 1,
            RetryOperation::MultiPartRead => 2,
            RetryOperation::MultiPartWrite => 3,
        }
    }

    /// Try ceiling used when nothing else is configured.
    pub fn default_max_tries(self) -> u8 {
        match self {
            RetryOperation::WriteOnly => 4,
            RetryOperation::WriteRead => 10,
            RetryOperation::MultiPartRead => 8,
            RetryOperation::MultiPartWrite => 8,
        }
    }
}

impl fmt::Display for RetryOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            RetryOperation::WriteOnly => "write-only",
            RetryOperation::WriteRead => "write-read",
            RetryOperation::MultiPartRead => "multi-part read",
            RetryOperation::MultiPartWrite => "multi-part write",
        })
    }
}

/// How a completed exchange ended, for the try histogram.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TryOutcome {
    /// A non-retryable error.
    Fatal,
    /// Every allowed try failed.
    Exhausted,
    /// Succeeded on the given try, counting from 1.
    Succeeded(u8),
}

impl TryOutcome {
    /// Histogram bucket for this outcome: 0 fatal, 1 exhausted, `n + 1`
    /// for success on try `n`.
    pub fn bucket(self) -> usize {
        match self {
            TryOutcome::Fatal => 0,
            TryOutcome::Exhausted => 1,
            TryOutcome::Succeeded(tries) => tries as usize + 1,
        }
    }
}

/// Number of histogram buckets needed for [`MAX_MAX_TRIES`].
pub const HISTOGRAM_BUCKETS: usize = MAX_MAX_TRIES as usize + 2;

/// Retry policy and statistics consulted by the retry engine.
pub trait RetryStats: Send + Sync {
    /// The try ceiling for `op` on `display`.
    fn max_tries(&self, display: &DisplayPath, op: RetryOperation) -> u8;

    /// Records how an exchange ended.
    fn record_tries(&self, display: &DisplayPath, op: RetryOperation, outcome: TryOutcome) -> Result<(), Error>;
}

/// Checks a try ceiling against [`MAX_MAX_TRIES`].
pub fn validate_max_tries(tries: u8) -> Result<u8, Error> {
    if tries == 0 || tries > MAX_MAX_TRIES {
        Err(Error::Config(format!("max tries must be between 1 and {}, got {}", MAX_MAX_TRIES, tries)))
    } else {
        Ok(tries)
    }
}
