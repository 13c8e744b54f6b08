#![deny(missing_docs)]

//! Control displays using the DDC/CI protocol, reliably.
//!
//! DDC/CI runs over I2C buses that drop, corrupt and delay frames, and
//! displays that differ in how they answer. This crate drives every
//! exchange to a definite result: failed tries are retried up to a
//! per-display ceiling, protocol delays are stretched for displays that
//! need it, and each display's way of reporting unsupported features is
//! learned and remembered.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ddc_exchange::{Config, Context, DisplayHandle, DisplayPath, DisplayRef};
//!
//! # #[cfg(feature = "i2c-linux")] fn ddc() -> Result<(), ddc_exchange::Error> {
//! let context = Context::new(Config::default())?;
//! let opener = ddc_exchange::LinuxI2cOpener;
//! let display = Arc::new(DisplayRef::detect(DisplayPath::i2c(4), &opener)?);
//! ddc_exchange::check_displays(&context, &[display.clone()], &opener);
//!
//! let mut handle = DisplayHandle::open(&context, display, &opener)?;
//! let brightness = handle.get_vcp_feature(0x10)?;
//! println!("brightness: {} / {}", brightness.value(), brightness.maximum());
//! handle.close()
//! # }
//! ```

/// EDID EEPROM I2C address
pub const I2C_ADDRESS_EDID: u16 = 0x50;

/// E-DDC EDID segment register I2C address
pub const I2C_ADDRESS_EDID_SEGMENT: u16 = 0x30;

/// DDC/CI command and control I2C address
pub const I2C_ADDRESS_DDC_CI: u16 = 0x37;

/// DDC sub-address command prefix
pub const SUB_ADDRESS_DDC_CI: u8 = 0x51;

/// DDC/CI command request and response types.
pub mod commands;
pub use commands::{Command, CommandResult, FeatureCode, VcpValue};

pub mod packet;

mod error;
pub use error::{Error, ErrorCode, Status};

mod transport;
pub use transport::{DisplayPath, Opener, Transport};

mod i2c_ddc;
pub use i2c_ddc::I2cTransport;
#[cfg(feature = "i2c-linux")]
pub use i2c_ddc::{I2cDeviceTransport, LinuxI2cOpener};

mod delay;
pub use delay::Delay;

mod sleep;
pub use sleep::{SleepEvent, SleepPolicy};

pub mod dsa;
pub use dsa::{DsaOptions, DsaSnapshot, DynamicSleep};

pub mod retry;
pub use retry::{RetryOperation, RetryStats, TryOutcome, MAX_MAX_TRIES};

mod barrier;
pub use barrier::{CrossDisplayGuard, CrossDisplayLock};

pub mod registry;
pub use registry::{DisplaySummary, Registry, RegistryDefaults, RetrySummary};

mod display;
pub use display::{DisplayFlags, DisplayRef, DisplayState, InvalidReason, UnsupportedSentinel};

mod handle;
pub use handle::{DisplayHandle, OpenHandles};

mod exchange;
pub use exchange::{is_fatal_errno, ExchangeOptions};

mod multi_part;

mod check;
pub use check::{check_communication, check_displays};

pub mod persist;
pub use persist::{DsaStore, FileStore};

pub mod config;
pub use config::Config;

mod context;
pub use context::Context;
