//! The first contact with each display: does it speak DDC/CI at all, and
//! how does it say that a feature is unsupported.

use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};
use crate::commands::{FeatureCode, GetVcpFeature};
use crate::context::Context;
use crate::display::{DisplayFlags, DisplayRef, InvalidReason, UnsupportedSentinel};
use crate::exchange::ExchangeOptions;
use crate::handle::DisplayHandle;
use crate::transport::{Opener, Transport};
use crate::{Error, Status};

/// Brightness, which practically every display supports.
pub const PROBE_FEATURE: FeatureCode = 0x10;

/// Unassigned feature codes, read to see how the display rejects them.
pub const UNSUPPORTED_PROBES: [FeatureCode; 2] = [0xdd, 0x00];

/// Maps a failed check to the reason recorded on the display.
pub fn invalid_reason(error: &Error) -> InvalidReason {
    if error.raw_os_error() == Some(libc::EBUSY) {
        InvalidReason::Busy
    } else if error.status() == Status::Disconnected {
        InvalidReason::Removed
    } else {
        InvalidReason::Invalid
    }
}

fn answered(error: &Error) -> bool {
    match error.status() {
        Status::DeterminedUnsupported => true,
        // the display is talking, it just has nothing to say
        Status::RetriesExceeded => error.all_causes(Status::NullResponse),
        _ => false,
    }
}

/// Checks that the display answers DDC/CI, once per display.
///
/// Working displays are then probed for how they signal unsupported
/// features, unless that is already known. Returns whether the display is
/// working.
pub fn check_communication<T: Transport>(handle: &mut DisplayHandle<T>) -> bool {
    let dref = handle.display().clone();
    if dref.is_communication_checked() {
        return dref.is_communication_working()
    }

    let result = match handle.get_vcp_feature(PROBE_FEATURE) {
        Ok(..) => Ok(()),
        Err(ref e) if answered(e) => Ok(()),
        Err(e) => {
            debug!(display = %dref.path(), error = %e, "communication check failed");
            Err(invalid_reason(&e))
        },
    };

    if !dref.mark_checked(result) {
        return dref.is_communication_working()
    }

    match result {
        Ok(()) => info!(display = %dref.path(), "display communication working"),
        Err(reason) => {
            info!(display = %dref.path(), %reason, "display communication failed");
            return false
        },
    }

    if !dref.flags().intersects(DisplayFlags::UNSUPPORTED_INDICATION) {
        probe_unsupported_indication(handle);
    }

    true
}

fn probe_unsupported_indication<T: Transport>(handle: &mut DisplayHandle<T>) {
    let dref = handle.display().clone();
    for &code in UNSUPPORTED_PROBES.iter() {
        let error = match handle.write_read_with_retry(&GetVcpFeature::new(code), ExchangeOptions::allow_all_zero()) {
            Ok(..) => continue,
            Err(e) => e,
        };

        match error.status() {
            // latched by the exchange
            Status::DeterminedUnsupported => (),
            Status::RetriesExceeded if error.all_causes(Status::NullResponse) => {
                dref.latch_sentinel(UnsupportedSentinel::NullResponse);
            },
            Status::Disconnected | Status::Io(..) => {
                debug!(display = %dref.path(), error = %error, "probe failed");
            },
            _ => {
                debug!(display = %dref.path(), feature = code, error = %error, "assuming unsupported flag");
                dref.latch_sentinel(UnsupportedSentinel::ExplicitFlag);
            },
        }

        debug!(display = %dref.path(), sentinel = ?dref.unsupported_sentinel(), "unsupported feature indication");
        return
    }

    warn!(display = %dref.path(), "display answered every unsupported feature probe");
    dref.latch_does_not_indicate();
}

fn check_one<O: Opener>(context: &Context, dref: &Arc<DisplayRef>, opener: &O) {
    if dref.is_communication_checked() {
        return
    }

    match DisplayHandle::open(context, dref.clone(), opener) {
        Ok(mut handle) => {
            check_communication(&mut handle);
            if let Err(e) = handle.close() {
                debug!(display = %dref.path(), error = %e, "error closing display after check");
            }
        },
        Err(Error::AlreadyOpen(..)) => {
            warn!(display = %dref.path(), "display open elsewhere, skipping check");
        },
        Err(e) => {
            let reason = invalid_reason(&e);
            if dref.mark_checked(Err(reason)) {
                info!(display = %dref.path(), %reason, error = %e, "failed to open display");
            }
        },
    }
}

/// Restores persisted sleep state, checks every display and numbers the
/// working ones in path order.
///
/// Displays are checked on their own threads once there are at least
/// `detection.async_threshold` of them. Returns the working displays in
/// display number order.
pub fn check_displays<O>(context: &Context, displays: &[Arc<DisplayRef>], opener: &O) -> Vec<Arc<DisplayRef>> where
    O: Opener + Sync,
{
    for dref in displays {
        context.restore_sleep(dref);
    }

    let threshold = context.config().detection.async_threshold;
    if displays.len() > 1 && displays.len() >= threshold {
        debug!(displays = displays.len(), "checking displays in parallel");
        thread::scope(|scope| {
            for dref in displays {
                scope.spawn(move || check_one(context, dref, opener));
            }
        });
    } else {
        for dref in displays {
            check_one(context, dref, opener);
        }
    }

    let mut working: Vec<_> = displays.iter()
        .filter(|dref| dref.is_communication_working() && !dref.is_removed())
        .cloned()
        .collect();
    working.sort_by_key(|dref| *dref.path());
    for (i, dref) in working.iter().enumerate() {
        let dispno = i as i32 + 1;
        dref.assign_dispno(dispno);
        info!(display = %dref.path(), dispno, "assigned display number");
    }

    working
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use crate::retry::RetryOperation;
    use crate::ErrorCode;

    #[test]
    fn reasons() {
        let busy = Error::Io(io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(invalid_reason(&busy), InvalidReason::Busy);
        assert_eq!(invalid_reason(&Error::Disconnected), InvalidReason::Removed);
        let exhausted = Error::RetriesExceeded {
            operation: RetryOperation::WriteRead,
            causes: vec![ErrorCode::InvalidChecksum.into()],
        };
        assert_eq!(invalid_reason(&exhausted), InvalidReason::Invalid);
        assert!(!answered(&exhausted));

        let nulls = Error::RetriesExceeded {
            operation: RetryOperation::WriteRead,
            causes: vec![ErrorCode::NullResponse.into(), ErrorCode::NullResponse.into()],
        };
        assert!(answered(&nulls));
    }
}
