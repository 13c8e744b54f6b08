use std::path::PathBuf;
use std::{fmt, io};

/// Where a display is attached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DisplayPath {
    /// An I2C bus, `/dev/i2c-N` on Linux.
    I2c {
        /// Bus number.
        bus: u32,
    },
    /// A USB HID monitor control interface.
    Usb {
        /// USB bus number.
        bus: u16,
        /// Device number on the bus.
        device: u16,
    },
}

impl DisplayPath {
    /// Shorthand for an I2C bus path.
    pub fn i2c(bus: u32) -> Self {
        DisplayPath::I2c { bus: bus }
    }

    /// The device node for paths that have one.
    pub fn device_node(&self) -> Option<PathBuf> {
        match *self {
            DisplayPath::I2c { bus } => Some(PathBuf::from(format!("/dev/i2c-{}", bus))),
            DisplayPath::Usb { .. } => None,
        }
    }
}

impl fmt::Display for DisplayPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DisplayPath::I2c { bus } => write!(f, "/dev/i2c-{}", bus),
            DisplayPath::Usb { bus, device } => write!(f, "usb:{}:{}", bus, device),
        }
    }
}

/// Raw byte channel to a display.
///
/// Errors are plain I/O errors; the retry engine classifies them by their
/// OS error number and otherwise treats them as opaque.
pub trait Transport {
    /// Selects the I2C slave address subsequent reads and writes go to.
    fn set_target_address(&mut self, address: u16) -> io::Result<()>;

    /// Writes a complete frame.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Reads up to `data.len()` bytes, returning how many were read.
    ///
    /// `bytewise` requests single byte reads for adapters that mangle
    /// larger transfers.
    fn read(&mut self, data: &mut [u8], bytewise: bool) -> io::Result<usize>;

    /// Reads the display's EDID starting at offset 0.
    fn read_edid(&mut self, data: &mut [u8]) -> io::Result<usize> {
        let _ = data;
        Err(io::Error::new(io::ErrorKind::Other, "EDID not available on this transport"))
    }

    /// Whether the device has gone away since it was opened.
    fn is_disconnected(&mut self) -> bool {
        false
    }

    /// Releases the underlying device.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens transports by path.
pub trait Opener {
    /// The transport this opener produces.
    type Transport: Transport;

    /// Opens the device at `path`.
    fn open(&self, path: &DisplayPath) -> io::Result<Self::Transport>;

    /// Out-of-band check whether the device at `path` has vanished.
    fn is_disconnected(&self, path: &DisplayPath) -> bool {
        let _ = path;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_order_by_bus() {
        let mut paths = vec![DisplayPath::i2c(7), DisplayPath::i2c(3), DisplayPath::i2c(5)];
        paths.sort();
        assert_eq!(paths, [DisplayPath::i2c(3), DisplayPath::i2c(5), DisplayPath::i2c(7)]);
        assert_eq!(paths[0].to_string(), "/dev/i2c-3");
        assert_eq!(paths[0].device_node(), Some(PathBuf::from("/dev/i2c-3")));
    }
}
