//! Values that span several frames: the capabilities string and table
//! features.
//!
//! Every fragment is its own exchange with retries. A failed sequence is
//! restarted from offset zero, up to the multi-part try ceiling.

use std::convert::TryFrom;
use tracing::{debug, trace};
use crate::commands::{self, FeatureCode, TABLE_FRAGMENT_LEN};
use crate::exchange::{is_fatal_errno, ExchangeOptions};
use crate::handle::DisplayHandle;
use crate::retry::{RetryOperation, TryOutcome};
use crate::transport::Transport;
use crate::{Error, ErrorCode, Status};

#[derive(Copy, Clone, Debug)]
enum ReadTarget {
    Capabilities,
    Table(FeatureCode),
}

/// What a failed sequence means for the next one.
fn ends_sequence(error: &Error) -> Option<TryOutcome> {
    match *error {
        Error::DeterminedUnsupported { .. } => Some(TryOutcome::Succeeded(1)),
        Error::AllTriesZero { .. } => Some(TryOutcome::Exhausted),
        // the display answers every fragment request with the null message
        Error::RetriesExceeded { .. } if error.all_causes(Status::NullResponse) => Some(TryOutcome::Exhausted),
        Error::Disconnected | Error::Fatal { .. } => Some(TryOutcome::Fatal),
        Error::Io(ref e) if e.raw_os_error().map(is_fatal_errno).unwrap_or(false) => Some(TryOutcome::Fatal),
        _ => None,
    }
}

impl<T: Transport> DisplayHandle<T> {
    /// Retrieve the capability string from the device.
    ///
    /// This executes multiple `CapabilitiesRequest` commands to construct the entire string.
    pub fn capabilities_string(&mut self) -> Result<Vec<u8>, Error> {
        self.multi_part_read_with_retry(ReadTarget::Capabilities, ExchangeOptions::default())
    }

    /// Read a table value from the device.
    pub fn table_read(&mut self, code: FeatureCode) -> Result<Vec<u8>, Error> {
        self.multi_part_read_with_retry(ReadTarget::Table(code), ExchangeOptions::default())
    }

    /// Write a table value to the device.
    ///
    /// An empty value is rejected with [`ErrorCode::InvalidLength`] before
    /// anything is written.
    pub fn table_write(&mut self, code: FeatureCode, value: &[u8]) -> Result<(), Error> {
        if value.is_empty() {
            return Err(ErrorCode::InvalidLength.into())
        }

        let op = RetryOperation::MultiPartWrite;
        self.multi_part_with_retry(op, |handle| handle.try_table_write(code, value))
    }

    fn read_fragment(&mut self, target: ReadTarget, offset: u16, options: ExchangeOptions) -> Result<(u16, Vec<u8>), Error> {
        match target {
            ReadTarget::Capabilities => {
                let caps = self.write_read_with_retry(&commands::CapabilitiesRequest::new(offset), options)?;
                Ok((caps.offset, caps.data.into_vec()))
            },
            ReadTarget::Table(code) => {
                let table = self.write_read_with_retry(&commands::TableRead::new(code, offset), options)?;
                Ok((table.offset, table.bytes().to_vec()))
            },
        }
    }

    fn try_multi_part_read(&mut self, target: ReadTarget, mut options: ExchangeOptions) -> Result<Vec<u8>, Error> {
        let mut value = Vec::new();
        loop {
            let offset = u16::try_from(value.len())
                .map_err(|_| Error::from(ErrorCode::InvalidLength))?;
            let (reply_offset, data) = self.read_fragment(target, offset, options)?;
            trace!(display = %self.display.path(), ?target, offset, len = data.len(), "read fragment");
            if reply_offset != offset {
                return Err(ErrorCode::InvalidOffset.into())
            } else if data.is_empty() {
                break
            }

            value.extend_from_slice(&data);
            // only the first fragment may legitimately be all zero
            options.allow_all_zero = false;
        }

        Ok(value)
    }

    fn try_table_write(&mut self, code: FeatureCode, value: &[u8]) -> Result<(), Error> {
        let mut offset = 0u16;
        for chunk in value.chunks(TABLE_FRAGMENT_LEN) {
            self.write_only_with_retry(&commands::TableWrite::new(code, offset, chunk))?;
            offset = u16::try_from(offset as usize + chunk.len())
                .map_err(|_| Error::from(ErrorCode::InvalidLength))?;
        }

        Ok(())
    }

    fn multi_part_read_with_retry(&mut self, target: ReadTarget, options: ExchangeOptions) -> Result<Vec<u8>, Error> {
        let op = RetryOperation::MultiPartRead;
        self.multi_part_with_retry(op, |handle| handle.try_multi_part_read(target, options))
    }

    fn multi_part_with_retry<R, F>(&mut self, op: RetryOperation, mut sequence: F) -> Result<R, Error> where
        F: FnMut(&mut Self) -> Result<R, Error>,
    {
        let path = *self.display.path();
        let max_tries = self.context.stats().max_tries(&path, op).max(1);

        let mut causes = Vec::new();
        let (res, outcome) = loop {
            let tries = causes.len() as u8 + 1;
            let error = match sequence(self) {
                Ok(value) => break (Ok(value), TryOutcome::Succeeded(tries)),
                Err(e) => e,
            };

            if let Some(outcome) = ends_sequence(&error) {
                let error = match outcome {
                    TryOutcome::Fatal if !causes.is_empty() => Error::Fatal {
                        error: Box::new(error),
                        causes: causes,
                    },
                    _ => error,
                };
                break (Err(error), outcome)
            }

            debug!(display = %path, %op, attempt = tries, error = %error, "multi-part sequence failed");
            causes.push(error);
            if causes.len() >= max_tries as usize {
                break (Err(Error::RetriesExceeded { operation: op, causes: causes }), TryOutcome::Exhausted)
            }
        };

        let _ = self.context.stats().record_tries(&path, op, outcome);
        res
    }
}
