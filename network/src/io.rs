// Byte-stream traits shared by TCP connections and UDP packets

use crate::error::NetError;

/// Buffered reads
///
/// Empty reads are not errors: `read_byte` and `peek` return `None` and
/// `read` returns 0.
pub trait Readable {
    /// Bytes readable without blocking
    fn available(&mut self) -> usize;

    fn read_byte(&mut self) -> Option<u8>;

    /// Read up to `buf.len()` bytes
    fn read(&mut self, buf: &mut [u8]) -> usize;

    fn peek(&mut self) -> Option<u8>;
}

/// Writes that report how much was accepted
pub trait Writable {
    fn write(&mut self, data: &[u8]) -> Result<usize, NetError>;

    fn write_byte(&mut self, byte: u8) -> Result<usize, NetError> {
        self.write(&[byte])
    }

    fn flush(&mut self);
}
