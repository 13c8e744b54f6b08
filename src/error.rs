use std::io;
use thiserror::Error;
use crate::display::{InvalidReason, UnsupportedSentinel};
use crate::retry::RetryOperation;
use crate::transport::DisplayPath;

/// DDC/CI protocol errors
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Error)]
pub enum ErrorCode {
    /// Expected matching offset from DDC/CI
    #[error("invalid offset returned from DDC/CI")]
    InvalidOffset,
    /// DDC/CI invalid packet length
    #[error("invalid DDC/CI length")]
    InvalidLength,
    /// Checksum mismatch
    #[error("DDC/CI checksum mismatch")]
    InvalidChecksum,
    /// Expected opcode mismatch
    #[error("DDC/CI VCP opcode mismatch")]
    InvalidOpcode,
    /// Expected data mismatch
    #[error("invalid DDC/CI data")]
    InvalidData,
    /// The display answered with the DDC/CI null message.
    ///
    /// Depending on the display this either means the feature is
    /// unsupported or that the display was not ready to answer.
    #[error("DDC/CI null response")]
    NullResponse,
    /// Every value byte of the response was zero.
    #[error("DDC/CI response bytes all zero")]
    AllZero,
    /// The display set the unsupported flag in its reply.
    #[error("display reported feature unsupported")]
    ReportedUnsupported,
    /// Custom unspecified error
    #[error("{0}")]
    Invalid(String),
}

/// An error that can occur during a DDC/CI exchange.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport I/O error
    #[error("DDC/CI I2C error: {0}")]
    Io(#[from] io::Error),
    /// DDC/CI protocol error or transmission corruption
    #[error("DDC/CI error: {0}")]
    Ddc(#[from] ErrorCode),
    /// The display is no longer attached.
    #[error("display disconnected")]
    Disconnected,
    /// A handle to the display is already open.
    #[error("display {0} is already open")]
    AlreadyOpen(DisplayPath),
    /// The display failed its communication check.
    #[error("display {path} is not usable: {reason}")]
    InvalidDisplay {
        /// Path of the display.
        path: DisplayPath,
        /// Why the display was marked invalid.
        reason: InvalidReason,
    },
    /// Every try of the exchange failed with a retryable error.
    #[error("{operation} exchange failed after {} tries", .causes.len())]
    RetriesExceeded {
        /// The exchange type.
        operation: RetryOperation,
        /// One error per try, in order.
        causes: Vec<Error>,
    },
    /// Every try read back a response of zeros.
    #[error("all {} tries returned zero", .causes.len())]
    AllTriesZero {
        /// One error per try, in order.
        causes: Vec<Error>,
    },
    /// The display signalled that the feature is not supported.
    #[error("feature unsupported ({sentinel})")]
    DeterminedUnsupported {
        /// How the display signalled it.
        sentinel: UnsupportedSentinel,
        /// Errors of the tries that led to the determination.
        causes: Vec<Error>,
    },
    /// A non-retryable error ended the exchange after earlier tries failed.
    #[error("{error} (after {} failed tries)", .causes.len())]
    Fatal {
        /// The error that stopped the exchange.
        #[source]
        error: Box<Error>,
        /// Errors of the preceding tries.
        causes: Vec<Error>,
    },
    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),
    /// Persisted state could not be read or written.
    #[error("stored state error: {0}")]
    Store(String),
}

/// Flat classification of an exchange result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    /// Retries exhausted.
    RetriesExceeded,
    /// Feature determined unsupported.
    DeterminedUnsupported,
    /// Every try read zeros.
    AllTriesZero,
    /// Display gone.
    Disconnected,
    /// Display already open.
    AlreadyOpen,
    /// Display failed its communication check.
    InvalidDisplay,
    /// Checksum mismatch.
    BadChecksum,
    /// Length mismatch.
    BadLength,
    /// Malformed or unexpected contents.
    InvalidData,
    /// Null message.
    NullResponse,
    /// Zeroed response.
    AllZero,
    /// Unsupported flag set by the display.
    ReportedUnsupported,
    /// Pass-through transport error.
    Io(io::ErrorKind),
    /// Bad configuration or stored state.
    Config,
}

impl Error {
    /// Classifies this error.
    ///
    /// `Fatal` reports the classification of the error that ended the
    /// exchange.
    pub fn status(&self) -> Status {
        match *self {
            Error::Io(ref e) => Status::Io(e.kind()),
            Error::Ddc(ref code) => code.status(),
            Error::Disconnected => Status::Disconnected,
            Error::AlreadyOpen(..) => Status::AlreadyOpen,
            Error::InvalidDisplay { .. } => Status::InvalidDisplay,
            Error::RetriesExceeded { .. } => Status::RetriesExceeded,
            Error::AllTriesZero { .. } => Status::AllTriesZero,
            Error::DeterminedUnsupported { .. } => Status::DeterminedUnsupported,
            Error::Fatal { ref error, .. } => error.status(),
            Error::Config(..) | Error::Store(..) => Status::Config,
        }
    }

    /// The per-try errors that led to this one, oldest first.
    pub fn causes(&self) -> &[Error] {
        match *self {
            Error::RetriesExceeded { ref causes, .. } |
            Error::AllTriesZero { ref causes } |
            Error::DeterminedUnsupported { ref causes, .. } |
            Error::Fatal { ref causes, .. } => causes,
            _ => &[],
        }
    }

    /// The OS error number of a transport error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match *self {
            Error::Io(ref e) => e.raw_os_error(),
            Error::Fatal { ref error, .. } => error.raw_os_error(),
            _ => None,
        }
    }

    /// Whether every cause has the given status.
    pub fn all_causes(&self, status: Status) -> bool {
        let causes = self.causes();
        !causes.is_empty() && causes.iter().all(|e| e.status() == status)
    }
}

impl ErrorCode {
    fn status(&self) -> Status {
        match *self {
            ErrorCode::InvalidChecksum => Status::BadChecksum,
            ErrorCode::InvalidLength => Status::BadLength,
            ErrorCode::NullResponse => Status::NullResponse,
            ErrorCode::AllZero => Status::AllZero,
            ErrorCode::ReportedUnsupported => Status::ReportedUnsupported,
            ErrorCode::InvalidOffset | ErrorCode::InvalidOpcode |
            ErrorCode::InvalidData | ErrorCode::Invalid(..) => Status::InvalidData,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            Error::Ddc(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            Error::Disconnected => io::Error::new(io::ErrorKind::NotFound, e),
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_of_fatal_is_inner() {
        let e = Error::Fatal {
            error: Box::new(Error::Disconnected),
            causes: vec![Error::Ddc(ErrorCode::InvalidChecksum)],
        };
        assert_eq!(e.status(), Status::Disconnected);
        assert_eq!(e.causes().len(), 1);
        assert!(e.to_string().contains("1 failed tries"));
    }

    #[test]
    fn all_causes_requires_causes() {
        let e = Error::RetriesExceeded {
            operation: RetryOperation::WriteRead,
            causes: Vec::new(),
        };
        assert!(!e.all_causes(Status::NullResponse));

        let e = Error::RetriesExceeded {
            operation: RetryOperation::WriteRead,
            causes: vec![ErrorCode::NullResponse.into(), ErrorCode::NullResponse.into()],
        };
        assert!(e.all_causes(Status::NullResponse));
        assert!(e.to_string().contains("2 tries"));
    }

    #[test]
    fn errno_passthrough() {
        let e = Error::from(io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(e.raw_os_error(), Some(libc::EIO));
        let io: io::Error = e.into();
        assert_eq!(io.raw_os_error(), Some(libc::EIO));
    }
}
