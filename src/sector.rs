use std::sync::Mutex;
use std::thread;

use checked_num::CheckedU64;
use log::{debug, trace};

use crate::crypto::xts::{SECTOR_SIZE, Xts};
use crate::device::BlockDevice;
use crate::error::VolumeError;

/// Batches at least this many sectors are split across worker threads.
const PARALLEL_THRESHOLD: usize = 16;
const MAX_WORKERS: usize = 8;

#[derive(Copy, Clone)]
enum Mode {
    Encrypt,
    Decrypt,
}

/// Plaintext-sector view of the encrypted data area.
///
/// All positioned I/O goes through a short critical section; encryption and
/// decryption always happen outside of it. Sector numbers are relative to
/// the data area, while the XTS unit numbers fed to the codec are absolute
/// sector indices from the start of the container.
pub struct SectorDevice<D> {
    device: D,
    xts: Xts,
    data_offset: u64,
    data_size: u64,
    io_lock: Mutex<()>,
    workers: usize,
}

impl<D: BlockDevice> SectorDevice<D> {
    pub(crate) fn new(device: D, xts: Xts, data_offset: u64, data_size: u64) -> Self {
        assert_eq!(data_offset % SECTOR_SIZE as u64, 0);
        assert_eq!(data_size % SECTOR_SIZE as u64, 0);
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(2, MAX_WORKERS);
        debug!(
            "sector device: {} sectors at offset {data_offset:#x}, {workers} crypto workers",
            data_size / SECTOR_SIZE as u64
        );
        Self {
            device,
            xts,
            data_offset,
            data_size,
            io_lock: Mutex::new(()),
            workers,
        }
    }

    /// Number of sectors in the data area.
    pub fn sector_count(&self) -> u64 {
        self.data_size / SECTOR_SIZE as u64
    }

    /// The raw device underneath, for accesses outside the data area.
    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    /// Size of the data area in bytes.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    fn byte_offset(&self, first: u64, count: usize) -> Result<u64, VolumeError> {
        let out_of_bounds = || VolumeError::OutOfBounds {
            offset: first.saturating_mul(SECTOR_SIZE as u64),
            len: count as u64 * SECTOR_SIZE as u64,
        };
        let end = ((CheckedU64::new(first) + count as u64) * SECTOR_SIZE as u64)
            .ok_or(out_of_bounds())?;
        if end > self.data_size {
            return Err(out_of_bounds());
        }
        Ok(self.data_offset + first * SECTOR_SIZE as u64)
    }

    pub fn read_sector(&self, sector: u64) -> Result<Vec<u8>, VolumeError> {
        self.read_sectors(sector, 1)
    }

    pub fn read_sectors(&self, first: u64, count: usize) -> Result<Vec<u8>, VolumeError> {
        let mut buf = vec![0u8; count * SECTOR_SIZE];
        self.read_sectors_into(first, &mut buf)?;
        Ok(buf)
    }

    pub fn read_sectors_into(&self, first: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        assert_eq!(buf.len() % SECTOR_SIZE, 0);
        let offset = self.byte_offset(first, buf.len() / SECTOR_SIZE)?;
        {
            let _io = self.io_lock.lock().unwrap();
            self.device.read_at(offset, buf)?;
        }
        self.crypt(buf, first, Mode::Decrypt);
        Ok(())
    }

    pub fn write_sectors(&self, first: u64, data: &[u8]) -> Result<(), VolumeError> {
        assert_eq!(data.len() % SECTOR_SIZE, 0);
        let offset = self.byte_offset(first, data.len() / SECTOR_SIZE)?;
        let mut buf = data.to_vec();
        self.crypt(&mut buf, first, Mode::Encrypt);
        let _io = self.io_lock.lock().unwrap();
        self.device.write_at(offset, &buf)?;
        Ok(())
    }

    fn crypt(&self, buf: &mut [u8], first: u64, mode: Mode) {
        let unit = self.data_offset / SECTOR_SIZE as u64 + first;
        let sectors = buf.len() / SECTOR_SIZE;
        if sectors < PARALLEL_THRESHOLD {
            match mode {
                Mode::Encrypt => self.xts.encrypt_sectors(buf, unit),
                Mode::Decrypt => self.xts.decrypt_sectors(buf, unit),
            }
            return;
        }

        let per_worker = sectors.div_ceil(self.workers);
        trace!("fanning {sectors} sectors across {} workers", self.workers);
        thread::scope(|scope| {
            for (index, chunk) in buf.chunks_mut(per_worker * SECTOR_SIZE).enumerate() {
                let start = unit + (index * per_worker) as u64;
                let xts = &self.xts;
                scope.spawn(move || match mode {
                    Mode::Encrypt => xts.encrypt_sectors(chunk, start),
                    Mode::Decrypt => xts.decrypt_sectors(chunk, start),
                });
            }
        });
    }
}
