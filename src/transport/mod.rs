//! Transport layer for I/O abstraction
//!
//! The hand is a byte-oriented duplex device. [`Transport`] is the seam
//! between the protocol code and the real world: the serial implementation
//! talks to hardware, the mock implementation feeds tests. [`SerialInterface`]
//! sits on top and owns the framing, packet counting and the receive worker.

use crate::error::{Error, Result};

mod interface;
mod mock;
mod serial;

pub use interface::{PacketCallback, SerialInterface};
pub use mock::MockTransport;
pub use serial::{SerialTransport, DEFAULT_BAUD_RATE};

/// Byte-oriented duplex device.
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read. A timeout on the
    /// underlying device reads as zero bytes.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush any pending writes.
    fn flush(&mut self) -> Result<()>;

    /// Check how many bytes are available to read.
    fn available(&mut self) -> Result<usize> {
        Ok(0) // Default implementation
    }

    /// Duplicate the handle. The receive worker reads on its own clone so no
    /// lock is held across a blocking device read.
    fn try_clone(&self) -> Result<Box<dyn Transport>>;

    /// Write the whole buffer or fail.
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let written = self.write(&data[offset..])?;
            if written == 0 {
                return Err(Error::TransportClosed);
            }
            offset += written;
        }
        Ok(())
    }
}
