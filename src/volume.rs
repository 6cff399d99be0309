use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::crypto::kdf::SALT_LEN;
use crate::crypto::keyfile::Keyfile;
use crate::crypto::xts::{SECTOR_SIZE, Xts};
use crate::device::BlockDevice;
use crate::error::VolumeError;
use crate::fat::{FatFilesystem, FileEntry};
use crate::format::{self, CreateVolumeOptions};
use crate::header::{BACKUP_GROUP_LEN, DATA_AREA_OFFSET, HEADER_LEN, HeaderFlags, VolumeHeader};
use crate::sector::SectorDevice;

/// A mounted volume: authenticated header plus the FAT32 engine over the
/// encrypted data area.
///
/// Mounting is atomic from the caller's point of view; a failed
/// [`Volume::open`] leaves nothing behind. Dropping (or [`Volume::close`])
/// wipes the master key, the header copy and the expanded AES key schedules.
pub struct Volume<D: BlockDevice> {
    header: VolumeHeader,
    fs: FatFilesystem<D>,
}

impl<D: BlockDevice> Volume<D> {
    /// Opens and authenticates a container. The primary header record is
    /// tried first; if it fails authentication, the backup record at the end
    /// of the container is tried before giving up.
    pub fn open(
        device: D,
        password: &[u8],
        pim: u32,
        keyfiles: &[Keyfile],
    ) -> Result<Self, VolumeError> {
        let len = device.len()?;
        if len < DATA_AREA_OFFSET + BACKUP_GROUP_LEN {
            return Err(VolumeError::Corrupt("container too small for a volume"));
        }

        let mut record = [0u8; HEADER_LEN];
        device.read_at(0, &mut record)?;
        let header = match VolumeHeader::decrypt(&record, password, pim, keyfiles) {
            Ok(header) => header,
            Err(VolumeError::AuthFailed) => {
                warn!("primary header rejected, trying the backup header");
                device.read_at(len - BACKUP_GROUP_LEN, &mut record)?;
                VolumeHeader::decrypt(&record, password, pim, keyfiles)?
            }
            Err(err) => return Err(err),
        };

        if header.sector_size != SECTOR_SIZE as u32 {
            return Err(VolumeError::Corrupt("unsupported sector size"));
        }
        if header.flags().contains(HeaderFlags::SYSTEM_ENCRYPTION) {
            return Err(VolumeError::Corrupt("system-encrypted volumes are not supported"));
        }
        if header.hidden_volume_size != 0 {
            return Err(VolumeError::Corrupt("hidden volumes are not supported"));
        }
        if header.data_area_offset % SECTOR_SIZE as u64 != 0
            || header.data_area_size % SECTOR_SIZE as u64 != 0
        {
            return Err(VolumeError::Corrupt("misaligned data area"));
        }
        let data_end = header
            .data_area_offset
            .checked_add(header.data_area_size)
            .ok_or(VolumeError::Corrupt("data area overflows"))?;
        if data_end > len {
            return Err(VolumeError::Corrupt("data area extends past the container"));
        }

        let xts = Xts::new(header.master_key())?;
        let sectors = Arc::new(SectorDevice::new(
            device,
            xts,
            header.data_area_offset,
            header.data_area_size,
        ));
        let fs = FatFilesystem::mount(sectors)?;
        debug!(
            "volume mounted: {} byte data area at {:#x}",
            header.data_area_size, header.data_area_offset
        );
        Ok(Self { header, fs })
    }

    /// Creates a container on `device` and mounts it.
    pub fn create(device: D, options: &CreateVolumeOptions) -> Result<Self, VolumeError> {
        format::create_volume(&device, options)?;
        Self::open(device, &options.password, options.pim, &options.keyfiles)
    }

    /// The decrypted header of this volume.
    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    /// The FAT volume label.
    pub fn volume_label(&self) -> String {
        self.fs.volume_label()
    }

    /// Re-encrypts the header pair under new credentials. The master key and
    /// the filesystem stay untouched, so the mounted volume remains usable;
    /// the next [`Volume::open`] requires the new credentials.
    pub fn change_password(
        &self,
        password: &[u8],
        pim: u32,
        keyfiles: &[Keyfile],
    ) -> Result<(), VolumeError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut header = self.header.clone();
        header.header_creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(header.header_creation_time);
        let record = header.encrypt(password, pim, keyfiles, &salt)?;

        let device = self.fs.device();
        let len = device.len()?;
        device.write_at(0, &record)?;
        device.write_at(len - BACKUP_GROUP_LEN, &record)?;
        debug!("header pair re-encrypted under new credentials");
        Ok(())
    }

    /// Lists a directory. `.` and `..` never appear.
    pub fn list(&self, path: &str) -> Result<Vec<FileEntry>, VolumeError> {
        self.fs.list(path)
    }

    pub fn stat(&self, path: &str) -> Result<FileEntry, VolumeError> {
        self.fs.stat(path)
    }

    pub fn exists(&self, path: &str) -> Result<bool, VolumeError> {
        self.fs.exists(path)
    }

    /// Reads a whole file.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, VolumeError> {
        self.fs.read(path)
    }

    /// Reads part of a file, clamped to its end.
    pub fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, VolumeError> {
        self.fs.read_range(path, offset, length)
    }

    /// Streams a file into `sink` without materialising it; a sink that
    /// closes early ends the stream without error. Returns the number of
    /// bytes delivered.
    pub fn stream(&self, path: &str, sink: &mut dyn Write) -> Result<u64, VolumeError> {
        self.fs.stream(path, sink)
    }

    /// Writes a whole file, creating it if needed.
    pub fn write(&self, path: &str, data: &[u8]) -> Result<(), VolumeError> {
        self.fs.write(path, data)
    }

    /// Writes a file of known size from a reader. `progress` observes
    /// `(bytes_written, total)` after every batch.
    pub fn write_streaming(
        &self,
        path: &str,
        source: &mut dyn Read,
        size: u64,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<(), VolumeError> {
        self.fs.write_streaming(path, source, size, progress)
    }

    /// Creates an empty file under `parent`.
    pub fn create_file(&self, parent: &str, name: &str) -> Result<(), VolumeError> {
        self.fs.create_file(parent, name)
    }

    pub fn create_directory(&self, parent: &str, name: &str) -> Result<(), VolumeError> {
        self.fs.create_directory(parent, name)
    }

    /// Deletes a file, or a directory tree recursively.
    pub fn delete(&self, path: &str) -> Result<(), VolumeError> {
        self.fs.remove(path)
    }

    pub fn free_space(&self) -> Result<u64, VolumeError> {
        self.fs.free_space()
    }

    pub fn total_space(&self) -> u64 {
        self.fs.total_space()
    }

    /// Unmounts the volume. Key material is wiped as the value is dropped.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::format::CreateVolumeOptionsBuilder;
    use std::io;

    const MIB: usize = 1024 * 1024;
    const PASSWORD: &[u8] = b"testpassword";

    fn options(size: usize) -> CreateVolumeOptions {
        CreateVolumeOptionsBuilder::default()
            .total_size(size as u64)
            .password(PASSWORD.to_vec())
            .pim(1)
            .build()
            .unwrap()
    }

    fn volume(size: usize) -> Volume<MemDevice> {
        Volume::create(MemDevice::new(size), &options(size)).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn create_then_open_reports_geometry() {
        let size = 10 * MIB;
        let device = Arc::new(MemDevice::new(size));
        let opts = options(size);
        Volume::create(Arc::clone(&device), &opts).unwrap().close();

        let reopened = Volume::open(device, PASSWORD, 1, &[]).unwrap();
        assert_eq!(reopened.header().data_area_size, 10_223_616);
        assert_eq!(reopened.header().data_area_offset, 131_072);
        assert_eq!(reopened.header().sector_size, 512);
    }

    #[test]
    fn wrong_password_fails_before_any_data_access() {
        let size = MIB;
        let device = Arc::new(MemDevice::new(size));
        Volume::create(Arc::clone(&device), &options(size)).unwrap().close();
        assert!(matches!(
            Volume::open(device, b"not the password", 1, &[]),
            Err(VolumeError::AuthFailed)
        ));
    }

    #[test]
    fn damaged_primary_header_falls_back_to_backup() {
        let size = MIB;
        let device = Arc::new(MemDevice::new(size));
        let vol = Volume::create(Arc::clone(&device), &options(size)).unwrap();
        vol.write("/kept.txt", b"still here").unwrap();
        vol.close();

        device.write_at(0, &[0u8; 512]).unwrap();
        let reopened = Volume::open(Arc::clone(&device), PASSWORD, 1, &[]).unwrap();
        assert_eq!(reopened.read("/kept.txt").unwrap(), b"still here");
    }

    #[test]
    fn keyfiles_are_part_of_the_credential() {
        let size = MIB;
        let device = Arc::new(MemDevice::new(size));
        let keyfiles = vec![Keyfile::new(b"keyfile_content_123".to_vec())];
        let opts = CreateVolumeOptionsBuilder::default()
            .total_size(size as u64)
            .password(b"".to_vec())
            .pim(1)
            .keyfiles(keyfiles.clone())
            .build()
            .unwrap();
        Volume::create(Arc::clone(&device), &opts).unwrap().close();

        assert!(matches!(
            Volume::open(Arc::clone(&device), b"", 1, &[]),
            Err(VolumeError::AuthFailed)
        ));
        let reopened = Volume::open(device, b"", 1, &keyfiles).unwrap();
        assert_eq!(reopened.list("/").unwrap().len(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let vol = volume(2 * MIB);
        let data = pattern(10_000);
        vol.write("/data.bin", &data).unwrap();
        assert_eq!(vol.read("/data.bin").unwrap(), data);

        let entry = vol.stat("/data.bin").unwrap();
        assert_eq!(entry.size, 10_000);
        assert_eq!(entry.name, "data.bin");
        assert!(!entry.is_directory);
        assert!(vol.exists("/data.bin").unwrap());
        assert!(!vol.exists("/other.bin").unwrap());
    }

    #[test]
    fn overwrite_replaces_contents() {
        let vol = volume(2 * MIB);
        vol.write("/f", &pattern(50_000)).unwrap();
        vol.write("/f", b"short").unwrap();
        assert_eq!(vol.read("/f").unwrap(), b"short");
        assert_eq!(vol.stat("/f").unwrap().size, 5);
    }

    #[test]
    fn ranged_reads_slice_the_file() {
        let vol = volume(2 * MIB);
        let data = pattern(20_000);
        vol.write("/r.bin", &data).unwrap();

        assert_eq!(vol.read_range("/r.bin", 0, 20_000).unwrap(), data);
        assert_eq!(
            vol.read_range("/r.bin", 4_000, 3_000).unwrap(),
            data[4_000..7_000]
        );
        // Crossing a cluster boundary off-alignment.
        assert_eq!(
            vol.read_range("/r.bin", 4_095, 2).unwrap(),
            data[4_095..4_097]
        );
        // Clamped at the end, empty past the end.
        assert_eq!(
            vol.read_range("/r.bin", 19_000, 5_000).unwrap(),
            data[19_000..]
        );
        assert!(vol.read_range("/r.bin", 25_000, 10).unwrap().is_empty());
    }

    #[test]
    fn streaming_read_matches_and_tolerates_early_close() {
        let vol = volume(2 * MIB);
        let data = pattern(30_000);
        vol.write("/s.bin", &data).unwrap();

        let mut sink = Vec::new();
        let delivered = vol.stream("/s.bin", &mut sink).unwrap();
        assert_eq!(delivered, 30_000);
        assert_eq!(sink, data);

        struct ClosingSink(usize);
        impl io::Write for ClosingSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe));
                }
                let n = buf.len().min(self.0);
                self.0 -= n;
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let delivered = vol.stream("/s.bin", &mut ClosingSink(1_000)).unwrap();
        assert!(delivered < 30_000);
    }

    #[test]
    fn streaming_write_round_trips_with_progress() {
        let vol = volume(4 * MIB);
        let data = pattern(700_000); // several 64-cluster batches
        let mut updates = Vec::new();
        {
            let mut callback = |written: u64, total: u64| updates.push((written, total));
            vol.write_streaming(
                "/big.bin",
                &mut io::Cursor::new(data.clone()),
                data.len() as u64,
                Some(&mut callback),
            )
            .unwrap();
        }
        assert_eq!(vol.read_range("/big.bin", 0, data.len() as u64).unwrap(), data);
        assert!(updates.len() >= 2);
        assert!(updates.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(updates.last().unwrap().0, data.len() as u64);
    }

    #[test]
    fn streaming_write_with_short_source_fails() {
        let vol = volume(2 * MIB);
        let result = vol.write_streaming(
            "/short.bin",
            &mut io::Cursor::new(vec![0u8; 100]),
            10_000,
            None,
        );
        assert!(matches!(result, Err(VolumeError::Io(_))));
    }

    #[test]
    fn directories_nest_and_list() {
        let vol = volume(2 * MIB);
        vol.create_directory("/", "docs").unwrap();
        vol.create_directory("/docs", "Sub Folder").unwrap();
        vol.write("/docs/Sub Folder/note.txt", b"hi").unwrap();

        let root = vol.list("/").unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "docs");
        assert!(root[0].is_directory);

        let sub = vol.list("/docs").unwrap();
        assert_eq!(sub[0].name, "Sub Folder");

        assert_eq!(vol.read("/docs/sub folder/NOTE.TXT").unwrap(), b"hi");
        assert!(matches!(
            vol.create_directory("/", "DOCS"),
            Err(VolumeError::AlreadyExists(_))
        ));
    }

    #[test]
    fn empty_file_creation_and_listing() {
        let vol = volume(2 * MIB);
        vol.create_file("/", "empty.dat").unwrap();
        assert_eq!(vol.stat("/empty.dat").unwrap().size, 0);
        assert_eq!(vol.read("/empty.dat").unwrap(), Vec::<u8>::new());
        assert!(matches!(
            vol.create_file("/", "empty.dat"),
            Err(VolumeError::AlreadyExists(_))
        ));
    }

    #[test]
    fn thirty_two_long_names_in_root() {
        let vol = volume(4 * MIB);
        for i in 0..32 {
            let name = format!("file-{i:06}.txt");
            vol.write(&format!("/{name}"), name.as_bytes()).unwrap();
        }
        let mut listed: Vec<String> =
            vol.list("/").unwrap().into_iter().map(|e| e.name).collect();
        listed.sort();
        let mut expected: Vec<String> = (0..32).map(|i| format!("file-{i:06}.txt")).collect();
        expected.sort();
        assert_eq!(listed, expected);

        for name in expected {
            assert_eq!(vol.read(&format!("/{name}")).unwrap(), name.as_bytes());
        }
    }

    #[test]
    fn directory_grows_past_its_first_cluster() {
        let vol = volume(4 * MIB);
        vol.create_directory("/", "many").unwrap();
        // 50 long-named files need 150 slots, more than the 128 one 4 KiB
        // cluster holds.
        for i in 0..50 {
            let name = format!("entry-{i:06}.dat");
            vol.write(&format!("/many/{name}"), &[i as u8; 17]).unwrap();
        }
        assert_eq!(vol.list("/many").unwrap().len(), 50);
        assert_eq!(vol.read("/many/entry-000049.dat").unwrap(), [49u8; 17]);
    }

    #[test]
    fn unicode_long_name_survives_remount() {
        let name = "A file with a long name and unicode — 测试.txt";
        let size = 2 * MIB;
        let device = Arc::new(MemDevice::new(size));
        let vol = Volume::create(Arc::clone(&device), &options(size)).unwrap();
        vol.write(&format!("/{name}"), b"hello").unwrap();
        vol.close();

        let reopened = Volume::open(device, PASSWORD, 1, &[]).unwrap();
        let listed = reopened.list("/").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, name);
        assert_eq!(reopened.read(&format!("/{name}")).unwrap(), b"hello");
    }

    #[test]
    fn delete_frees_space_and_recurses() {
        let vol = volume(2 * MIB);
        let before = vol.free_space().unwrap();

        vol.create_directory("/", "tree").unwrap();
        vol.write("/tree/a.bin", &pattern(9_000)).unwrap();
        vol.create_directory("/tree", "inner").unwrap();
        vol.write("/tree/inner/b.bin", &pattern(5_000)).unwrap();
        assert!(vol.free_space().unwrap() < before);

        vol.delete("/tree").unwrap();
        assert!(!vol.exists("/tree").unwrap());
        assert!(!vol.exists("/tree/inner/b.bin").unwrap());
        assert_eq!(vol.free_space().unwrap(), before);
    }

    #[test]
    fn delete_then_create_matches_fresh_create() {
        let vol = volume(2 * MIB);
        vol.write("/x.txt", b"first life").unwrap();
        vol.delete("/x.txt").unwrap();
        assert!(!vol.exists("/x.txt").unwrap());
        vol.write("/x.txt", b"second life").unwrap();
        assert_eq!(vol.read("/x.txt").unwrap(), b"second life");
        assert_eq!(vol.list("/").unwrap().len(), 1);
    }

    #[test]
    fn disk_full_is_reported() {
        let vol = volume(format::MIN_VOLUME_SIZE as usize);
        let free = vol.free_space().unwrap();
        assert!(matches!(
            vol.write("/huge.bin", &vec![1u8; free as usize + 8192]),
            Err(VolumeError::DiskFull)
        ));
        // The volume stays usable.
        vol.write("/ok.bin", b"fits").unwrap();
        assert_eq!(vol.read("/ok.bin").unwrap(), b"fits");
    }

    #[test]
    fn space_accounting_is_cluster_granular() {
        let vol = volume(2 * MIB);
        let total = vol.total_space();
        let before = vol.free_space().unwrap();
        assert!(before <= total);

        vol.write("/c.bin", &pattern(5_000)).unwrap(); // two 4 KiB clusters
        assert_eq!(vol.free_space().unwrap(), before - 8_192);
    }

    #[test]
    fn change_password_rewrites_both_headers() {
        let size = MIB;
        let device = Arc::new(MemDevice::new(size));
        let vol = Volume::create(Arc::clone(&device), &options(size)).unwrap();
        vol.write("/f", b"data").unwrap();
        vol.change_password(b"new password", 1, &[]).unwrap();
        // The mounted volume keeps working on the old master key.
        assert_eq!(vol.read("/f").unwrap(), b"data");
        vol.close();

        assert!(matches!(
            Volume::open(Arc::clone(&device), PASSWORD, 1, &[]),
            Err(VolumeError::AuthFailed)
        ));
        let reopened = Volume::open(device, b"new password", 1, &[]).unwrap();
        assert_eq!(reopened.read("/f").unwrap(), b"data");
    }

    #[test]
    fn volume_label_round_trips() {
        let size = MIB;
        let opts = CreateVolumeOptionsBuilder::default()
            .total_size(size as u64)
            .password(PASSWORD.to_vec())
            .pim(1)
            .volume_label(*b"HOLIDAY PIX")
            .build()
            .unwrap();
        let vol = Volume::create(MemDevice::new(size), &opts).unwrap();
        assert_eq!(vol.volume_label(), "HOLIDAY PIX");
    }

    #[test]
    fn concurrent_readers_share_the_volume() {
        let vol = volume(2 * MIB);
        let data = pattern(100_000);
        vol.write("/shared.bin", &data).unwrap();
        vol.create_directory("/", "dir").unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..5 {
                        assert_eq!(vol.read("/shared.bin").unwrap(), data);
                        assert_eq!(vol.list("/").unwrap().len(), 2);
                        assert_eq!(vol.stat("/shared.bin").unwrap().size, 100_000);
                    }
                });
            }
        });
    }

    #[test]
    fn used_space_bounds_the_file_sizes() {
        let vol = volume(2 * MIB);
        vol.write("/a", &pattern(10_000)).unwrap();
        vol.write("/b", &pattern(123)).unwrap();
        vol.create_directory("/", "c").unwrap();

        let used = vol.total_space() - vol.free_space().unwrap();
        let listed: u64 = vol.list("/").unwrap().iter().map(|e| e.size).sum();
        assert!(listed <= used);
        assert!(used <= vol.header().data_area_size);
    }

    #[test]
    fn not_a_file_and_not_found_errors() {
        let vol = volume(2 * MIB);
        vol.create_directory("/", "d").unwrap();
        assert!(matches!(vol.read("/d"), Err(VolumeError::NotAFile(_))));
        assert!(matches!(vol.read("/nope"), Err(VolumeError::NotFound(_))));
        assert!(matches!(
            vol.list("/d/nothing"),
            Err(VolumeError::NotFound(_))
        ));
        assert!(matches!(
            vol.write("/d", b"x"),
            Err(VolumeError::NotAFile(_))
        ));
        assert!(matches!(
            vol.delete("/"),
            Err(VolumeError::InvalidArgument(_))
        ));
    }
}
