use std::io;
use std::ops::Deref;
use std::sync::{Arc, RwLock};

/// Positioned byte-level access to a container. A block device is not
/// encryption-aware; it owns no cryptographic state.
pub trait BlockDevice: Send + Sync {
    /// Total size of the device in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Reads exactly `buf.len()` bytes starting at the given byte offset.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes all of `buf` starting at the given byte offset.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &T {
    fn len(&self) -> io::Result<u64> {
        (*self).len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (*self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        (*self).write_at(offset, buf)
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn len(&self) -> io::Result<u64> {
        self.deref().len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.deref().read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.deref().write_at(offset, buf)
    }
}

impl BlockDevice for std::fs::File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        let mut offset = offset;
        while !buf.is_empty() {
            match std::os::windows::fs::FileExt::seek_read(self, buf, offset)? {
                0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write_at(&self, offset: u64, mut buf: &[u8]) -> io::Result<()> {
        let mut offset = offset;
        while !buf.is_empty() {
            match std::os::windows::fs::FileExt::seek_write(self, buf, offset)? {
                0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

/// Fixed-size in-memory device backed by a byte vector. Used by the test
/// suite and by embedders that keep containers in RAM.
#[derive(Debug)]
pub struct MemDevice(RwLock<Vec<u8>>);

impl MemDevice {
    /// A zero-filled device of the given size.
    pub fn new(size: usize) -> Self {
        Self(RwLock::new(vec![0u8; size]))
    }

    /// Wraps an existing container image.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(RwLock::new(bytes))
    }

    /// Consumes the device and returns the raw image.
    pub fn into_inner(self) -> Vec<u8> {
        self.0.into_inner().unwrap()
    }
}

impl BlockDevice for MemDevice {
    fn len(&self) -> io::Result<u64> {
        Ok(self.0.read().unwrap().len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let bytes = self.0.read().unwrap();
        let start = usize::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or(io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut bytes = self.0.write().unwrap();
        let start = usize::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::WriteZero))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or(io::Error::from(io::ErrorKind::WriteZero))?;
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}
