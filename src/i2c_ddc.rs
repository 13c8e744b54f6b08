use std::path::PathBuf;
use std::{cmp, io};
use resize_slice::ResizeSlice;
use crate::transport::Transport;
#[cfg(feature = "i2c-linux")]
use crate::transport::{DisplayPath, Opener};

/// A DDC/CI transport over an I2C master.
#[derive(Clone, Debug)]
pub struct I2cTransport<I> {
    inner: I,
    node: Option<PathBuf>,
}

/// DDC/CI on Linux i2c-dev
#[cfg(feature = "i2c-linux")]
pub type I2cDeviceTransport = I2cTransport<::i2c_linux::I2c<::std::fs::File>>;

impl<I> I2cTransport<I> {
    /// Create a new transport with an existing open device.
    pub fn new(i2c: I) -> Self {
        I2cTransport {
            inner: i2c,
            node: None,
        }
    }

    /// Create a new transport that watches `node` to detect disconnection.
    pub fn with_node(i2c: I, node: PathBuf) -> Self {
        I2cTransport {
            inner: i2c,
            node: Some(node),
        }
    }

    /// Consume the transport to return the inner device.
    pub fn into_inner(self) -> I {
        self.inner
    }

    /// Borrow the inner device.
    pub fn inner_ref(&self) -> &I {
        &self.inner
    }

    /// Mutably borrow the inner device.
    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.inner
    }
}

fn io_error<E: Into<io::Error>>(e: E) -> io::Error {
    e.into()
}

impl<I> Transport for I2cTransport<I> where
    I: i2c::Address + i2c::ReadWrite + i2c::BlockTransfer,
    I::Error: Into<io::Error>,
{
    fn set_target_address(&mut self, address: u16) -> io::Result<()> {
        self.inner.set_slave_address(address, false).map_err(Into::into)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.i2c_write(data).map_err(Into::into)
    }

    fn read(&mut self, data: &mut [u8], bytewise: bool) -> io::Result<usize> {
        if !bytewise {
            return self.inner.i2c_read(data).map_err(Into::into)
        }

        let mut len = 0;
        for byte in data.chunks_mut(1) {
            if self.inner.i2c_read(byte).map_err(io_error)? == 0 {
                break
            }
            len += 1;
        }

        Ok(len)
    }

    fn read_edid(&mut self, mut data: &mut [u8]) -> io::Result<usize> {
        self.inner.set_slave_address(crate::I2C_ADDRESS_EDID, false).map_err(io_error)?;

        let mut offset = 0u8;
        let mut len = 0;
        while !data.is_empty() {
            let datalen = cmp::min(0x80, data.len());
            let read = self.inner.i2c_read_block_data(offset, &mut data[..datalen]).map_err(io_error)?;
            if read == 0 {
                break
            }
            len += read;
            offset = if let Some(offset) = offset.checked_add(read as u8) {
                offset
            } else {
                break
            };
            data.resize_from(read);
        }

        Ok(len)
    }

    fn is_disconnected(&mut self) -> bool {
        self.node.as_ref().map(|node| !node.exists()).unwrap_or(false)
    }
}

/// Opens `/dev/i2c-N` device nodes.
#[cfg(feature = "i2c-linux")]
#[derive(Copy, Clone, Debug, Default)]
pub struct LinuxI2cOpener;

#[cfg(feature = "i2c-linux")]
impl Opener for LinuxI2cOpener {
    type Transport = I2cDeviceTransport;

    fn open(&self, path: &DisplayPath) -> io::Result<I2cDeviceTransport> {
        let node = path.device_node()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("{} is not an I2C bus", path)))?;
        let i2c = ::i2c_linux::I2c::from_path(&node)?;

        Ok(I2cTransport::with_node(i2c, node))
    }

    fn is_disconnected(&self, path: &DisplayPath) -> bool {
        path.device_node().map(|node| !node.exists()).unwrap_or(false)
    }
}
