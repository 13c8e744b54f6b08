//! Driving one DDC/CI exchange to a definite result.
//!
//! Each try writes the request, waits, and reads and validates the reply.
//! Transport glitches and corrupted frames are retried up to the display's
//! ceiling for the operation type. Replies that may mean "unsupported"
//! (the null message or an all-zero value) are interpreted through what
//! the display is known to do, latching that knowledge when a reply
//! settles it.

use std::{cmp, io, thread};
use tracing::{debug, trace};
use crate::commands::{Command, CommandResult};
use crate::delay::Delay;
use crate::display::UnsupportedSentinel;
use crate::handle::DisplayHandle;
use crate::packet::{build_request, parse_reply, DDC_DEST_ADDRESS, MAX_DATA_LEN};
use crate::retry::{RetryOperation, TryOutcome, MAX_MAX_TRIES, MAX_NULL_RESPONSE_TRIES};
use crate::sleep::SleepEvent;
use crate::transport::Transport;
use crate::{Error, ErrorCode, SUB_ADDRESS_DDC_CI};

/// Caller hints for a write-read exchange.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// An all-zero reply means the feature is unsupported.
    pub allow_all_zero: bool,
}

impl ExchangeOptions {
    /// Options that accept an all-zero reply as unsupported.
    pub fn allow_all_zero() -> Self {
        ExchangeOptions {
            allow_all_zero: true,
        }
    }
}

/// Errno values that mean the device, not the transfer, is the problem.
pub fn is_fatal_errno(errno: i32) -> bool {
    errno == libc::EBADF || errno == libc::ENODEV || errno == libc::EBUSY
}

/// How a failed try affects the exchange.
enum Disposition {
    Retry,
    NullResponse,
    AllZero,
    Unsupported(UnsupportedSentinel),
    Fatal,
}

impl<T: Transport> DisplayHandle<T> {
    fn max_tries(&self, op: RetryOperation) -> u8 {
        cmp::min(cmp::max(self.context.stats().max_tries(self.display.path(), op), 1), MAX_MAX_TRIES)
    }

    fn record_tries(&self, op: RetryOperation, outcome: TryOutcome) {
        // logged by the recorder
        let _ = self.context.stats().record_tries(self.display.path(), op, outcome);
    }

    fn set_post_delay(&mut self, event: SleepEvent) {
        let delay = self.context.sleep().adjusted_delay(self.display.path(), event);
        self.delay = Delay::new(event, delay);
    }

    fn encode_request<C: Command>(command: &C) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::with_capacity(MAX_DATA_LEN);
        command.payload(&mut payload)?;
        if payload.len() >= MAX_DATA_LEN {
            return Err(ErrorCode::InvalidLength.into())
        }

        Ok(build_request(DDC_DEST_ADDRESS, SUB_ADDRESS_DDC_CI, C::OPCODE, &payload))
    }

    fn transfer(&mut self, request: &[u8], reply: &mut [u8]) -> io::Result<usize> {
        self.transport.write(request)?;
        let delay = self.context.sleep().adjusted_delay(self.display.path(), SleepEvent::WriteToRead);
        thread::sleep(delay);
        self.transport.read(reply, self.context.config().i2c.read_bytewise)
    }

    fn try_write_read<C: Command>(&mut self, command: &C, request: &[u8]) -> Result<C::Ok, Error> {
        self.delay.sleep();

        let mut reply = [0u8; MAX_DATA_LEN + 3];
        let reply_len = cmp::min(C::Ok::MAX_LEN + 3, reply.len());
        let res = match self.transfer(&request[1..], &mut reply[..reply_len]) {
            Ok(len) => {
                let raw = &reply[..cmp::min(len, reply_len)];
                trace!(display = %self.display.path(), reply = ?raw, "read reply");
                parse_reply(raw, C::REPLY_OPCODE)
                    .and_then(|packet| command.decode(packet.bytes()))
                    .map_err(Error::from)
            },
            Err(e) => Err(e.into()),
        };

        self.set_post_delay(if res.is_ok() { C::POST_EXCHANGE } else { SleepEvent::CommandFailed });
        res
    }

    fn try_write_only<C: Command>(&mut self, request: &[u8]) -> Result<(), Error> {
        self.delay.sleep();
        let res = self.transport.write(&request[1..]).map_err(Error::from);
        self.set_post_delay(if res.is_ok() { C::POST_EXCHANGE } else { SleepEvent::CommandFailed });
        res
    }

    /// Classifies a failed try, turning transport errors on a vanished
    /// device into [`Error::Disconnected`].
    fn classify(&mut self, error: Error) -> (Error, Disposition) {
        let disposition = match error {
            Error::Ddc(ErrorCode::NullResponse) => Disposition::NullResponse,
            Error::Ddc(ErrorCode::AllZero) => Disposition::AllZero,
            Error::Ddc(ErrorCode::ReportedUnsupported) => Disposition::Unsupported(UnsupportedSentinel::ExplicitFlag),
            Error::Io(ref e) => {
                if e.raw_os_error().map(is_fatal_errno).unwrap_or(false) {
                    Disposition::Fatal
                } else if self.transport.is_disconnected() {
                    debug!(display = %self.display.path(), error = %e, "I/O error on disconnected display");
                    self.display.mark_removed();
                    return (Error::Disconnected, Disposition::Fatal)
                } else {
                    Disposition::Retry
                }
            },
            Error::Disconnected => Disposition::Fatal,
            _ => Disposition::Retry,
        };

        (error, disposition)
    }

    fn fatal(error: Error, causes: Vec<Error>) -> Error {
        if causes.is_empty() {
            error
        } else {
            Error::Fatal {
                error: Box::new(error),
                causes: causes,
            }
        }
    }

    /// Ends an exchange on a feature the display does not have. `latch`
    /// records `sentinel` as the display's way of saying so.
    fn determined_unsupported(&self, sentinel: UnsupportedSentinel, latch: bool, causes: Vec<Error>) -> Error {
        if latch {
            self.display.latch_sentinel(sentinel);
        }
        debug!(display = %self.display.path(), %sentinel, tries = causes.len(), "feature determined unsupported");
        Error::DeterminedUnsupported {
            sentinel: sentinel,
            causes: causes,
        }
    }

    /// Writes a request and reads its reply, retrying failed tries.
    pub fn write_read_with_retry<C: Command>(&mut self, command: &C, options: ExchangeOptions) -> Result<C::Ok, Error> {
        let op = RetryOperation::WriteRead;
        let path = *self.display.path();
        let request = Self::encode_request(command)?;
        let max_tries = self.max_tries(op);
        self.context.sleep().begin_exchange(&path);

        let mut causes = Vec::new();
        let mut null_responses = 0u8;
        let mut all_zero = 0u8;
        let (res, outcome) = loop {
            let tries = causes.len() as u8 + 1;
            trace!(display = %path, attempt = tries, max_tries, "write-read try");

            let error = match self.try_write_read(command, &request) {
                Ok(value) => {
                    self.context.sleep().record_outcome(&path, true);
                    break (Ok(value), TryOutcome::Succeeded(tries))
                },
                Err(e) => e,
            };

            let sentinel = self.display.unsupported_sentinel();
            let (error, disposition) = self.classify(error);
            let mut bus_error = true;
            match disposition {
                Disposition::Fatal => {
                    self.context.sleep().record_outcome(&path, false);
                    break (Err(Self::fatal(error, causes)), TryOutcome::Fatal)
                },
                Disposition::Unsupported(sentinel) => {
                    self.context.sleep().record_outcome(&path, true);
                    causes.push(error);
                    break (Err(self.determined_unsupported(sentinel, true, causes)), TryOutcome::Succeeded(1))
                },
                Disposition::AllZero if options.allow_all_zero || sentinel == Some(UnsupportedSentinel::AllZero) => {
                    self.context.sleep().record_outcome(&path, true);
                    causes.push(error);
                    break (Err(self.determined_unsupported(UnsupportedSentinel::AllZero, true, causes)), TryOutcome::Succeeded(1))
                },
                Disposition::NullResponse => {
                    null_responses += 1;
                    causes.push(error);
                    // a null here says the feature is absent, not that the bus is flaky
                    if C::NULL_MEANS_UNSUPPORTED || sentinel == Some(UnsupportedSentinel::NullResponse) {
                        bus_error = false;
                        if null_responses >= cmp::min(MAX_NULL_RESPONSE_TRIES, max_tries) {
                            self.context.sleep().record_outcome(&path, true);
                            let error = self.determined_unsupported(UnsupportedSentinel::NullResponse, false, causes);
                            break (Err(error), TryOutcome::Succeeded(1))
                        }
                    }
                },
                Disposition::AllZero => {
                    all_zero += 1;
                    causes.push(error);
                },
                Disposition::Retry => causes.push(error),
            }

            if bus_error {
                self.context.sleep().record_outcome(&path, false);
            }
            if causes.len() >= max_tries as usize {
                let error = if all_zero as usize == causes.len() {
                    Error::AllTriesZero {
                        causes: causes,
                    }
                } else {
                    Error::RetriesExceeded {
                        operation: op,
                        causes: causes,
                    }
                };
                break (Err(error), TryOutcome::Exhausted)
            }
            if bus_error {
                self.context.sleep().note_retry(&path);
            }
        };

        match res {
            Ok(..) => debug!(display = %path, ?outcome, "write-read exchange succeeded"),
            Err(ref e) => debug!(display = %path, ?outcome, error = %e, "write-read exchange failed"),
        }
        self.record_tries(op, outcome);
        res
    }

    /// Writes a request that has no reply, retrying failed tries.
    pub fn write_only_with_retry<C: Command>(&mut self, command: &C) -> Result<(), Error> {
        let op = RetryOperation::WriteOnly;
        let path = *self.display.path();
        let request = Self::encode_request(command)?;
        let max_tries = self.max_tries(op);
        self.context.sleep().begin_exchange(&path);

        let mut causes = Vec::new();
        let (res, outcome) = loop {
            let tries = causes.len() as u8 + 1;
            trace!(display = %path, attempt = tries, max_tries, "write-only try");

            let error = match self.try_write_only::<C>(&request) {
                Ok(()) => {
                    self.context.sleep().record_outcome(&path, true);
                    break (Ok(()), TryOutcome::Succeeded(tries))
                },
                Err(e) => e,
            };

            self.context.sleep().record_outcome(&path, false);
            match self.classify(error) {
                (error, Disposition::Fatal) => break (Err(Self::fatal(error, causes)), TryOutcome::Fatal),
                (error, _) => causes.push(error),
            }

            if causes.len() >= max_tries as usize {
                break (Err(Error::RetriesExceeded { operation: op, causes: causes }), TryOutcome::Exhausted)
            }
            self.context.sleep().note_retry(&path);
        };

        match res {
            Ok(..) => debug!(display = %path, ?outcome, "write-only exchange succeeded"),
            Err(ref e) => debug!(display = %path, ?outcome, error = %e, "write-only exchange failed"),
        }
        self.record_tries(op, outcome);
        res
    }
}
