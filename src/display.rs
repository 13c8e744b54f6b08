use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::{fmt, io};
use bitflags::bitflags;
use tracing::{debug, trace};
use crate::transport::{DisplayPath, Opener, Transport};

/// Length of the base EDID block.
pub const EDID_LEN: usize = 128;

bitflags! {
    /// What is known about a display's DDC/CI behaviour.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct DisplayFlags: u32 {
        /// The initial communication check has run.
        const COMMUNICATION_CHECKED = 1 << 0;
        /// The initial communication check succeeded.
        const COMMUNICATION_WORKING = 1 << 1;
        /// Unsupported features are answered with the unsupported flag set.
        const USES_EXPLICIT_FLAG_FOR_UNSUPPORTED = 1 << 2;
        /// Unsupported features are answered with the null message.
        const USES_NULL_RESPONSE_FOR_UNSUPPORTED = 1 << 3;
        /// Unsupported features are answered with an all-zero value.
        const USES_ALL_ZERO_FOR_UNSUPPORTED = 1 << 4;
        /// Every probed feature answered, unsupported or not.
        const DOES_NOT_INDICATE_UNSUPPORTED = 1 << 5;
        /// The display has been detached.
        const REMOVED = 1 << 6;

        /// Mutually exclusive classifications of how unsupported features
        /// are signalled.
        const UNSUPPORTED_INDICATION = Self::USES_EXPLICIT_FLAG_FOR_UNSUPPORTED.bits()
            | Self::USES_NULL_RESPONSE_FOR_UNSUPPORTED.bits()
            | Self::USES_ALL_ZERO_FOR_UNSUPPORTED.bits()
            | Self::DOES_NOT_INDICATE_UNSUPPORTED.bits();
    }
}

/// The ways a display can signal that a feature is unsupported.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnsupportedSentinel {
    /// The unsupported result code in a Get VCP Feature reply.
    ExplicitFlag,
    /// The DDC/CI null message.
    NullResponse,
    /// A reply whose value bytes are all zero.
    AllZero,
}

impl UnsupportedSentinel {
    /// The display flag recording this sentinel.
    pub fn flag(self) -> DisplayFlags {
        match self {
            UnsupportedSentinel::ExplicitFlag => DisplayFlags::USES_EXPLICIT_FLAG_FOR_UNSUPPORTED,
            UnsupportedSentinel::NullResponse => DisplayFlags::USES_NULL_RESPONSE_FOR_UNSUPPORTED,
            UnsupportedSentinel::AllZero => DisplayFlags::USES_ALL_ZERO_FOR_UNSUPPORTED,
        }
    }

    fn from_flags(flags: DisplayFlags) -> Option<Self> {
        if flags.contains(DisplayFlags::USES_EXPLICIT_FLAG_FOR_UNSUPPORTED) {
            Some(UnsupportedSentinel::ExplicitFlag)
        } else if flags.contains(DisplayFlags::USES_NULL_RESPONSE_FOR_UNSUPPORTED) {
            Some(UnsupportedSentinel::NullResponse)
        } else if flags.contains(DisplayFlags::USES_ALL_ZERO_FOR_UNSUPPORTED) {
            Some(UnsupportedSentinel::AllZero)
        } else {
            None
        }
    }
}

impl fmt::Display for UnsupportedSentinel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            UnsupportedSentinel::ExplicitFlag => "unsupported flag",
            UnsupportedSentinel::NullResponse => "null response",
            UnsupportedSentinel::AllZero => "all zero response",
        })
    }
}

/// Why a display did not get a display number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InvalidReason {
    /// Communication failed.
    Invalid,
    /// A second path to a display already numbered.
    Phantom,
    /// The display went away.
    Removed,
    /// Another driver holds the bus.
    Busy,
}

impl InvalidReason {
    /// The non-positive display number encoding this reason.
    pub fn dispno(self) -> i32 {
        match self {
            InvalidReason::Invalid => -1,
            InvalidReason::Phantom => -2,
            InvalidReason::Removed => -3,
            InvalidReason::Busy => -4,
        }
    }

    /// Decodes a display number, `None` unless it encodes a reason.
    pub fn from_dispno(dispno: i32) -> Option<Self> {
        match dispno {
            -1 => Some(InvalidReason::Invalid),
            -2 => Some(InvalidReason::Phantom),
            -3 => Some(InvalidReason::Removed),
            -4 => Some(InvalidReason::Busy),
            _ => None,
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            InvalidReason::Invalid => "communication failed",
            InvalidReason::Phantom => "phantom display",
            InvalidReason::Removed => "display removed",
            InvalidReason::Busy => "bus busy",
        })
    }
}

/// Where a display is in its lifecycle, as far as its reference knows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisplayState {
    /// Found but not yet checked.
    Detected,
    /// Checked and answering DDC/CI.
    Working,
    /// Checked and unusable.
    Failed(InvalidReason),
}

/// A detected display, shared between handles and the detection scan.
#[derive(Debug)]
pub struct DisplayRef {
    path: DisplayPath,
    edid: Option<Box<[u8]>>,
    flags: AtomicU32,
    dispno: AtomicI32,
}

impl DisplayRef {
    /// Creates a reference for `path`.
    pub fn new(path: DisplayPath, edid: Option<Box<[u8]>>) -> Self {
        DisplayRef {
            path: path,
            edid: edid,
            flags: AtomicU32::new(0),
            dispno: AtomicI32::new(0),
        }
    }

    /// Opens `path` to read its EDID, creating a reference for it.
    ///
    /// A display that fails to return a complete EDID still gets a
    /// reference, without one.
    pub fn detect<O: Opener>(path: DisplayPath, opener: &O) -> io::Result<Self> {
        let mut transport = opener.open(&path)?;
        let mut edid = [0u8; EDID_LEN];
        let edid = match transport.read_edid(&mut edid) {
            Ok(EDID_LEN) => Some(edid.to_vec().into_boxed_slice()),
            Ok(len) => {
                debug!(display = %path, len, "short EDID read");
                None
            },
            Err(e) => {
                debug!(display = %path, error = %e, "failed to read EDID");
                None
            },
        };
        if let Err(e) = transport.close() {
            debug!(display = %path, error = %e, "error closing display after detection");
        }

        Ok(DisplayRef::new(path, edid))
    }

    /// The transport path.
    pub fn path(&self) -> &DisplayPath {
        &self.path
    }

    /// The cached EDID, if one was read.
    pub fn edid(&self) -> Option<&[u8]> {
        self.edid.as_ref().map(|edid| &edid[..])
    }

    /// Key under which per-display state is persisted.
    ///
    /// Uses the manufacturer, product and serial block of the EDID so the
    /// key follows the display between buses.
    pub fn persistence_key(&self) -> String {
        match self.edid() {
            Some(edid) if edid.len() >= 18 => edid[8..18].iter()
                .map(|b| format!("{:02x}", b))
                .collect(),
            _ => self.path.to_string(),
        }
    }

    /// Current flags.
    pub fn flags(&self) -> DisplayFlags {
        DisplayFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn insert_flags(&self, flags: DisplayFlags) -> DisplayFlags {
        DisplayFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// The sentinel this display has been observed to use, if any.
    pub fn unsupported_sentinel(&self) -> Option<UnsupportedSentinel> {
        UnsupportedSentinel::from_flags(self.flags())
    }

    /// Records `sentinel` unless a classification is already latched.
    ///
    /// Returns whether this call latched it.
    pub fn latch_sentinel(&self, sentinel: UnsupportedSentinel) -> bool {
        self.latch_indication(sentinel.flag())
    }

    /// Records that the display answered every probe, so it has no way to
    /// signal unsupported features.
    pub fn latch_does_not_indicate(&self) -> bool {
        self.latch_indication(DisplayFlags::DOES_NOT_INDICATE_UNSUPPORTED)
    }

    fn latch_indication(&self, flag: DisplayFlags) -> bool {
        let exclusive = DisplayFlags::UNSUPPORTED_INDICATION.bits();
        let latched = self.flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            if bits & exclusive != 0 {
                None
            } else {
                Some(bits | flag.bits())
            }
        }).is_ok();

        if latched {
            debug!(display = %self.path, ?flag, "latched unsupported feature indication");
        } else {
            trace!(display = %self.path, ?flag, "unsupported feature indication already latched");
        }
        latched
    }

    /// Whether the communication check has run.
    pub fn is_communication_checked(&self) -> bool {
        self.flags().contains(DisplayFlags::COMMUNICATION_CHECKED)
    }

    /// Whether the communication check succeeded.
    pub fn is_communication_working(&self) -> bool {
        self.flags().contains(DisplayFlags::COMMUNICATION_WORKING)
    }

    /// Records the communication check result.
    ///
    /// Only the first call has any effect; returns whether it was this one.
    pub(crate) fn mark_checked(&self, result: Result<(), InvalidReason>) -> bool {
        let flags = match result {
            Ok(()) => DisplayFlags::COMMUNICATION_CHECKED | DisplayFlags::COMMUNICATION_WORKING,
            Err(..) => DisplayFlags::COMMUNICATION_CHECKED,
        };
        let first = self.flags.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            if bits & DisplayFlags::COMMUNICATION_CHECKED.bits() != 0 {
                None
            } else {
                Some(bits | flags.bits())
            }
        }).is_ok();

        if first {
            if let Err(reason) = result {
                self.mark_invalid(reason);
            }
        }
        first
    }

    /// Whether the display has been marked removed.
    pub fn is_removed(&self) -> bool {
        self.flags().contains(DisplayFlags::REMOVED)
    }

    /// Marks the display as detached.
    pub fn mark_removed(&self) {
        if !self.insert_flags(DisplayFlags::REMOVED).contains(DisplayFlags::REMOVED) {
            debug!(display = %self.path, "display removed");
        }
        self.mark_invalid(InvalidReason::Removed);
    }

    /// Flags the display unusable.
    pub fn mark_invalid(&self, reason: InvalidReason) {
        self.dispno.store(reason.dispno(), Ordering::Release);
    }

    /// The display number: positive once assigned, zero before, negative
    /// for an invalid display.
    pub fn dispno(&self) -> i32 {
        self.dispno.load(Ordering::Acquire)
    }

    /// Why the display is invalid, if it is.
    pub fn invalid_reason(&self) -> Option<InvalidReason> {
        InvalidReason::from_dispno(self.dispno())
    }

    pub(crate) fn assign_dispno(&self, dispno: i32) {
        self.dispno.store(dispno, Ordering::Release);
    }

    /// Lifecycle state derived from the flags and display number.
    pub fn state(&self) -> DisplayState {
        if let Some(reason) = self.invalid_reason() {
            return DisplayState::Failed(reason)
        }

        let flags = self.flags();
        if !flags.contains(DisplayFlags::COMMUNICATION_CHECKED) {
            DisplayState::Detected
        } else if flags.contains(DisplayFlags::COMMUNICATION_WORKING) {
            DisplayState::Working
        } else {
            DisplayState::Failed(InvalidReason::Invalid)
        }
    }
}

impl fmt::Display for DisplayRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.dispno() {
            n if n > 0 => write!(f, "display {} ({})", n, self.path),
            _ => write!(f, "{}", self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_sentinel_wins() {
        let dref = DisplayRef::new(DisplayPath::i2c(4), None);
        assert_eq!(dref.unsupported_sentinel(), None);
        assert!(dref.latch_sentinel(UnsupportedSentinel::NullResponse));
        assert!(!dref.latch_sentinel(UnsupportedSentinel::ExplicitFlag));
        assert!(!dref.latch_does_not_indicate());
        assert_eq!(dref.unsupported_sentinel(), Some(UnsupportedSentinel::NullResponse));
    }

    #[test]
    fn concurrent_latch_has_one_winner() {
        let dref = Arc::new(DisplayRef::new(DisplayPath::i2c(4), None));
        let sentinels = [UnsupportedSentinel::ExplicitFlag, UnsupportedSentinel::NullResponse, UnsupportedSentinel::AllZero];
        let wins: usize = sentinels.iter().map(|&s| {
            let dref = dref.clone();
            thread::spawn(move || dref.latch_sentinel(s))
        }).collect::<Vec<_>>().into_iter()
            .map(|t| t.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!((dref.flags() & DisplayFlags::UNSUPPORTED_INDICATION).bits().count_ones(), 1);
    }

    #[test]
    fn check_latches_once() {
        let dref = DisplayRef::new(DisplayPath::i2c(2), None);
        assert_eq!(dref.state(), DisplayState::Detected);
        assert!(dref.mark_checked(Err(InvalidReason::Busy)));
        assert!(!dref.mark_checked(Ok(())));
        assert_eq!(dref.state(), DisplayState::Failed(InvalidReason::Busy));
        assert_eq!(dref.dispno(), -4);
        assert!(!dref.is_communication_working());
    }

    #[test]
    fn persistence_key_prefers_edid() {
        let mut edid = vec![0u8; EDID_LEN];
        edid[8..18].copy_from_slice(&[0x10, 0xac, 0x2d, 0xa0, 0x4c, 0x50, 0x30, 0x32, 0x1a, 0x1c]);
        let dref = DisplayRef::new(DisplayPath::i2c(6), Some(edid.into_boxed_slice()));
        assert_eq!(dref.persistence_key(), "10ac2da04c5030321a1c");

        let dref = DisplayRef::new(DisplayPath::i2c(6), None);
        assert_eq!(dref.persistence_key(), "/dev/i2c-6");
    }

    #[test]
    fn removal_is_reported() {
        let dref = DisplayRef::new(DisplayPath::i2c(1), None);
        dref.mark_removed();
        assert!(dref.is_removed());
        assert_eq!(dref.invalid_reason(), Some(InvalidReason::Removed));
    }
}
