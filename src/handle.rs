use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use crate::commands::{self, Command, CommandResult, FeatureCode, TimingMessage, VcpValue};
use crate::context::Context;
use crate::delay::Delay;
use crate::display::DisplayRef;
use crate::exchange::ExchangeOptions;
use crate::transport::{DisplayPath, Opener, Transport};
use crate::{Error, I2C_ADDRESS_DDC_CI};

/// Paths that currently have an open [`DisplayHandle`].
#[derive(Debug, Default)]
pub struct OpenHandles {
    paths: Mutex<HashSet<DisplayPath>>,
}

impl OpenHandles {
    fn paths(&self) -> MutexGuard<HashSet<DisplayPath>> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks `path` open, returning false if it already was.
    pub fn insert(&self, path: DisplayPath) -> bool {
        self.paths().insert(path)
    }

    /// Clears the open marker of `path`.
    pub fn remove(&self, path: &DisplayPath) -> bool {
        self.paths().remove(path)
    }

    /// Whether `path` has an open handle.
    pub fn contains(&self, path: &DisplayPath) -> bool {
        self.paths().contains(path)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.paths().len()
    }

    /// Whether no handle is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An open DDC/CI session with one display.
///
/// At most one handle exists per display path. Exchanges on a handle run
/// one at a time; each waits out the delay owed by the previous command.
pub struct DisplayHandle<T: Transport> {
    pub(crate) transport: T,
    pub(crate) display: Arc<DisplayRef>,
    pub(crate) context: Context,
    pub(crate) delay: Delay,
    open: bool,
}

impl<T: Transport> DisplayHandle<T> {
    /// Opens the display referenced by `display`.
    ///
    /// Fails with [`Error::Disconnected`] when the display is gone, with
    /// [`Error::InvalidDisplay`] when it failed its communication check and
    /// with [`Error::AlreadyOpen`] when another handle to it exists.
    pub fn open<O: Opener<Transport = T>>(context: &Context, display: Arc<DisplayRef>, opener: &O) -> Result<Self, Error> {
        let path = *display.path();
        if display.is_removed() || opener.is_disconnected(&path) {
            display.mark_removed();
            return Err(Error::Disconnected)
        }

        if let Some(reason) = display.invalid_reason() {
            return Err(Error::InvalidDisplay {
                path: path,
                reason: reason,
            })
        }

        if !context.open_handles().insert(path) {
            return Err(Error::AlreadyOpen(path))
        }

        let transport = match opener.open(&path) {
            Ok(transport) => transport,
            Err(e) => {
                context.open_handles().remove(&path);
                return Err(e.into())
            },
        };

        DisplayHandle::attach(context, display, transport)
    }

    /// Wraps a transport the caller already opened.
    pub fn from_transport(context: &Context, display: Arc<DisplayRef>, transport: T) -> Result<Self, Error> {
        let path = *display.path();
        if !context.open_handles().insert(path) {
            return Err(Error::AlreadyOpen(path))
        }

        DisplayHandle::attach(context, display, transport)
    }

    fn attach(context: &Context, display: Arc<DisplayRef>, transport: T) -> Result<Self, Error> {
        // the open marker is released by Drop from here on
        let mut handle = DisplayHandle {
            transport: transport,
            display: display,
            context: context.clone(),
            delay: Default::default(),
            open: true,
        };
        handle.transport.set_target_address(I2C_ADDRESS_DDC_CI)?;
        debug!(display = %handle.display.path(), "opened display");

        Ok(handle)
    }

    /// Closes the handle.
    ///
    /// The handle is closed even if the transport reports an error.
    pub fn close(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        if !self.open {
            return Ok(())
        }
        self.open = false;

        self.context.save_sleep(&self.display);
        self.context.open_handles().remove(self.display.path());
        let res = self.transport.close();
        debug!(display = %self.display.path(), ok = res.is_ok(), "closed display");
        res.map_err(Into::into)
    }

    /// The display this handle talks to.
    pub fn display(&self) -> &Arc<DisplayRef> {
        &self.display
    }

    /// The display's path.
    pub fn path(&self) -> &DisplayPath {
        self.display.path()
    }

    /// The context the handle was opened with.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Borrow the transport.
    pub fn inner_ref(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Wait for any previous commands to complete.
    ///
    /// The DDC specification defines delay intervals that must occur between
    /// execution of two subsequent commands, this waits for the amount of time
    /// remaining since the last command was executed. This is normally done
    /// internally and shouldn't need to be called manually unless synchronizing
    /// with an external process or another handle to the same device. It may
    /// however be desireable to run this before program exit.
    pub fn sleep(&mut self) {
        self.delay.sleep()
    }

    /// Reads the display's EDID into `data`.
    pub fn read_edid(&mut self, data: &mut [u8]) -> Result<usize, Error> {
        self.delay.sleep();
        let res = self.transport.read_edid(data);
        self.transport.set_target_address(I2C_ADDRESS_DDC_CI)?;
        res.map_err(Into::into)
    }

    /// Execute a DDC/CI command with retries. See the `commands` module
    /// for all available commands. The return type is dependent on the
    /// executed command.
    pub fn execute<C: Command>(&mut self, command: C) -> Result<C::Ok, Error> {
        if C::REPLY_OPCODE.is_some() {
            self.write_read_with_retry(&command, ExchangeOptions::default())
        } else {
            self.write_only_with_retry(&command)?;
            C::Ok::decode(&[]).map_err(Into::into)
        }
    }

    /// Reads a VCP feature.
    pub fn get_vcp_feature(&mut self, code: FeatureCode) -> Result<VcpValue, Error> {
        self.write_read_with_retry(&commands::GetVcpFeature::new(code), ExchangeOptions::default())
    }

    /// Writes a VCP feature.
    pub fn set_vcp_feature(&mut self, code: FeatureCode, value: u16) -> Result<(), Error> {
        self.write_only_with_retry(&commands::SetVcpFeature::new(code, value))
    }

    /// Asks the display to store its current settings.
    pub fn save_current_settings(&mut self) -> Result<(), Error> {
        self.write_only_with_retry(&commands::SaveCurrentSettings)
    }

    /// Reads the display's timing report.
    pub fn get_timing_report(&mut self) -> Result<TimingMessage, Error> {
        self.write_read_with_retry(&commands::GetTimingReport, ExchangeOptions::default())
    }
}

impl<T: Transport> Drop for DisplayHandle<T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(display = %self.display.path(), error = %e, "error closing display");
        }
    }
}

impl<T: Transport> ::std::fmt::Debug for DisplayHandle<T> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        f.debug_struct("DisplayHandle")
            .field("display", &self.display)
            .field("delay", &self.delay)
            .field("open", &self.open)
            .finish()
    }
}
