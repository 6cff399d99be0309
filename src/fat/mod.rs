//! FAT32 engine over the encrypted sector device: path resolution, listing
//! with long-name reconstruction, cluster-chain file I/O, allocation and
//! directory mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::cache::Cache;
use crate::device::BlockDevice;
use crate::error::VolumeError;
use crate::sector::SectorDevice;

pub(crate) mod boot_sector;
mod dir;
mod file;
mod table;
mod time;

pub use dir::FileEntry;

use boot_sector::BootSector;
use dir::{DirScanner, FileAttributes, RawDirEntry};
use table::Fat;

const LISTING_CACHE_CAPACITY: usize = 64;
const CHAIN_CACHE_CAPACITY: usize = 128;
const STAT_CACHE_CAPACITY: usize = 256;
/// Longest name accepted for a directory entry, in UTF-16 code units.
const MAX_NAME_UNITS: usize = 255;

/// A mounted FAT32 filesystem.
///
/// Reads run concurrently; every mutation serialises through the volume-wide
/// write lock. The caches are kept consistent by invalidation on mutation,
/// never by expiry.
pub struct FatFilesystem<D> {
    dev: Arc<SectorDevice<D>>,
    boot: Arc<BootSector>,
    fat: Fat<D>,
    listing: Cache<String, Arc<Vec<FileEntry>>>,
    listing_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    chains: Cache<u32, Arc<Vec<u32>>>,
    stats: Cache<String, FileEntry>,
    write_lock: Mutex<()>,
}

impl<D: BlockDevice> FatFilesystem<D> {
    pub(crate) fn mount(dev: Arc<SectorDevice<D>>) -> Result<Self, VolumeError> {
        let sector = dev.read_sector(0)?;
        let boot = Arc::new(BootSector::parse(&sector)?);
        if boot.bytes_per_sector != 512 {
            return Err(VolumeError::Corrupt("unsupported FAT sector size"));
        }
        if boot.root_dir_first_cluster < 2 {
            return Err(VolumeError::Corrupt("volume is not FAT32"));
        }
        if boot.total_sectors as u64 > dev.sector_count() {
            return Err(VolumeError::Corrupt("filesystem larger than the data area"));
        }
        debug!(
            "mounted FAT32 volume: {} clusters of {} bytes, label {:?}",
            boot.cluster_count(),
            boot.cluster_size(),
            String::from_utf8_lossy(&boot.volume_label)
        );
        let fat = Fat::new(Arc::clone(&dev), Arc::clone(&boot));
        Ok(Self {
            dev,
            boot,
            fat,
            listing: Cache::new(LISTING_CACHE_CAPACITY),
            listing_locks: Mutex::new(HashMap::new()),
            chains: Cache::new(CHAIN_CACHE_CAPACITY),
            stats: Cache::new(STAT_CACHE_CAPACITY),
            write_lock: Mutex::new(()),
        })
    }

    pub(crate) fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>, VolumeError> {
        self.dev.read_sectors(
            self.boot.sector_of_cluster(cluster),
            self.boot.sectors_per_cluster as usize,
        )
    }

    pub(crate) fn write_cluster(&self, cluster: u32, data: &[u8]) -> Result<(), VolumeError> {
        assert_eq!(data.len(), self.boot.cluster_size() as usize);
        self.dev
            .write_sectors(self.boot.sector_of_cluster(cluster), data)
    }

    /// The synthesised root entry: empty name, path `/`, the boot sector's
    /// root cluster.
    fn root_entry(&self) -> FileEntry {
        FileEntry {
            name: String::new(),
            path: "/".to_string(),
            is_directory: true,
            size: 0,
            last_modified: UNIX_EPOCH,
            first_cluster: self.boot.root_dir_first_cluster,
        }
    }

    /// Resolves a path to its entry, walking one listing per component.
    pub fn resolve(&self, path: &str) -> Result<FileEntry, VolumeError> {
        let norm = normalize(path);
        if norm == "/" {
            return Ok(self.root_entry());
        }
        if let Some(hit) = self.stats.get(&norm) {
            return Ok(hit);
        }

        let mut current = self.root_entry();
        for component in norm[1..].split('/') {
            if !current.is_directory {
                return Err(VolumeError::NotADirectory(current.path));
            }
            let entries = self.list_dir(&current)?;
            match entries.iter().find(|e| e.name.to_lowercase() == component) {
                Some(next) => current = next.clone(),
                None => return Err(VolumeError::NotFound(path.to_string())),
            }
        }
        self.stats.insert(norm, current.clone());
        Ok(current)
    }

    pub fn stat(&self, path: &str) -> Result<FileEntry, VolumeError> {
        self.resolve(path)
    }

    pub fn exists(&self, path: &str) -> Result<bool, VolumeError> {
        match self.resolve(path) {
            Ok(_) => Ok(true),
            Err(VolumeError::NotFound(_) | VolumeError::NotADirectory(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn list(&self, path: &str) -> Result<Vec<FileEntry>, VolumeError> {
        let entry = self.resolve(path)?;
        Ok(self.list_dir(&entry)?.as_ref().clone())
    }

    /// Lists one directory through the cache. Concurrent listers of the same
    /// path collapse onto a single read: late arrivals block on the per-path
    /// slot and then serve from the freshly installed listing.
    fn list_dir(&self, dir: &FileEntry) -> Result<Arc<Vec<FileEntry>>, VolumeError> {
        if !dir.is_directory {
            return Err(VolumeError::NotADirectory(dir.path.clone()));
        }
        let key = normalize(&dir.path);
        if let Some(hit) = self.listing.get(&key) {
            return Ok(hit);
        }

        let slot = {
            let mut locks = self.listing_locks.lock().unwrap();
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _slot_guard = slot.lock().unwrap();
        if let Some(hit) = self.listing.get(&key) {
            return Ok(hit);
        }

        let (_, buf) = self.load_dir(dir.first_cluster)?;
        let mut entries = Vec::new();
        let mut scanner = DirScanner::new(&buf, self.boot.cluster_size() as usize);
        while let Some(found) = scanner.next_entry() {
            if found.name == "." || found.name == ".." {
                continue;
            }
            entries.push(self.entry_from_scan(&found, &key));
        }
        let entries = Arc::new(entries);
        self.listing.insert(key.clone(), Arc::clone(&entries));
        self.listing_locks.lock().unwrap().remove(&key);
        Ok(entries)
    }

    fn entry_from_scan(&self, scanned: &dir::ScannedEntry, parent_key: &str) -> FileEntry {
        let path = if parent_key == "/" {
            format!("/{}", scanned.name)
        } else {
            format!("{}/{}", parent_key, scanned.name)
        };
        let is_directory = scanned.raw.is_directory();
        FileEntry {
            name: scanned.name.clone(),
            path,
            is_directory,
            size: if is_directory { 0 } else { scanned.raw.size() as u64 },
            last_modified: scanned.raw.modified(),
            first_cluster: scanned.raw.first_cluster(),
        }
    }

    /// Cluster chain of a file, through the cache. An empty file (first
    /// cluster 0) has an empty chain.
    pub(crate) fn chain_of(&self, first_cluster: u32) -> Result<Arc<Vec<u32>>, VolumeError> {
        if first_cluster == 0 {
            return Ok(Arc::new(Vec::new()));
        }
        if let Some(hit) = self.chains.get(&first_cluster) {
            return Ok(hit);
        }
        let chain = Arc::new(self.fat.chain(first_cluster)?);
        self.chains.insert(first_cluster, Arc::clone(&chain));
        Ok(chain)
    }

    fn find_in(&self, dir: &FileEntry, name: &str) -> Result<Option<FileEntry>, VolumeError> {
        let wanted = name.to_lowercase();
        Ok(self
            .list_dir(dir)?
            .iter()
            .find(|e| e.name.to_lowercase() == wanted)
            .cloned())
    }

    pub fn create_file(&self, parent: &str, name: &str) -> Result<(), VolumeError> {
        let _write = self.write_lock.lock().unwrap();
        self.create_file_locked(parent, name)
    }

    fn create_file_locked(&self, parent: &str, name: &str) -> Result<(), VolumeError> {
        validate_name(name)?;
        let parent_entry = self.resolve(parent)?;
        if !parent_entry.is_directory {
            return Err(VolumeError::NotADirectory(parent.to_string()));
        }
        if self.find_in(&parent_entry, name)?.is_some() {
            return Err(VolumeError::AlreadyExists(join(&parent_entry.path, name)));
        }
        let entries =
            dir::build_entries(name, FileAttributes::ARCHIVE, 0, 0, SystemTime::now());
        self.insert_entries(parent_entry.first_cluster, &entries)?;
        self.invalidate_listing(&normalize(&parent_entry.path));
        Ok(())
    }

    pub fn create_directory(&self, parent: &str, name: &str) -> Result<(), VolumeError> {
        let _write = self.write_lock.lock().unwrap();
        let result = self.create_directory_locked(parent, name);
        if result.is_err() {
            self.fat.invalidate_free_count();
        }
        result
    }

    fn create_directory_locked(&self, parent: &str, name: &str) -> Result<(), VolumeError> {
        validate_name(name)?;
        let parent_entry = self.resolve(parent)?;
        if !parent_entry.is_directory {
            return Err(VolumeError::NotADirectory(parent.to_string()));
        }
        if self.find_in(&parent_entry, name)?.is_some() {
            return Err(VolumeError::AlreadyExists(join(&parent_entry.path, name)));
        }

        let cluster = self.fat.allocate(1)?[0];
        self.fat.write_chain(&[cluster])?;

        // Seed the new directory with its `.` and `..` entries; `..` points
        // at cluster 0 when the parent is the root.
        let now = SystemTime::now();
        let (date, time) = time::encode(now);
        let parent_link = if normalize(&parent_entry.path) == "/" {
            0
        } else {
            parent_entry.first_cluster
        };
        let mut seed = vec![0u8; self.boot.cluster_size() as usize];
        let dot = RawDirEntry::new_short(
            *b".          ",
            FileAttributes::DIRECTORY,
            cluster,
            0,
            date,
            time,
        );
        let dotdot = RawDirEntry::new_short(
            *b"..         ",
            FileAttributes::DIRECTORY,
            parent_link,
            0,
            date,
            time,
        );
        seed[..32].copy_from_slice(&dot.0);
        seed[32..64].copy_from_slice(&dotdot.0);
        self.write_cluster(cluster, &seed)?;

        let entries = dir::build_entries(name, FileAttributes::DIRECTORY, cluster, 0, now);
        self.insert_entries(parent_entry.first_cluster, &entries)?;
        self.invalidate_listing(&normalize(&parent_entry.path));
        Ok(())
    }

    /// Deletes a file, or a directory and everything below it.
    pub fn remove(&self, path: &str) -> Result<(), VolumeError> {
        let _write = self.write_lock.lock().unwrap();
        self.remove_locked(path)
    }

    fn remove_locked(&self, path: &str) -> Result<(), VolumeError> {
        let norm = normalize(path);
        if norm == "/" {
            return Err(VolumeError::InvalidArgument("cannot delete the root directory"));
        }
        let entry = self.resolve(path)?;
        if entry.is_directory {
            let children = self.list_dir(&entry)?;
            for child in children.iter() {
                self.remove_locked(&child.path)?;
            }
        }

        let (parent_path, name) = parent_and_name(path)?;
        let parent = self.resolve(&parent_path)?;
        self.erase_entry(parent.first_cluster, &name)?;
        if entry.first_cluster != 0 {
            self.fat.free_chain(entry.first_cluster)?;
            self.chains.remove(&entry.first_cluster);
        }
        self.invalidate_listing(&normalize(&parent_path));
        self.invalidate_entry(&norm);
        Ok(())
    }

    /// The volume label from the boot record, trailing padding removed.
    pub fn volume_label(&self) -> String {
        String::from_utf8_lossy(&self.boot.volume_label)
            .trim_end()
            .to_string()
    }

    pub(crate) fn device(&self) -> &D {
        self.dev.device()
    }

    pub fn free_space(&self) -> Result<u64, VolumeError> {
        Ok(self.fat.free_cluster_count()? * self.boot.cluster_size() as u64)
    }

    pub fn total_space(&self) -> u64 {
        self.boot.cluster_count() as u64 * self.boot.cluster_size() as u64
    }

    fn invalidate_listing(&self, key: &str) {
        self.listing.remove(&key.to_string());
    }

    fn invalidate_entry(&self, key: &str) {
        self.stats.remove(&key.to_string());
        self.listing.remove(&key.to_string());
    }
}

/// Normalised form used for every cache key: lowercase, leading `/`, no
/// trailing `/`, no empty components. The root is `/`.
fn normalize(path: &str) -> String {
    let mut norm = String::with_capacity(path.len() + 1);
    for component in path.split('/').filter(|c| !c.is_empty()) {
        norm.push('/');
        norm.push_str(&component.to_lowercase());
    }
    if norm.is_empty() {
        norm.push('/');
    }
    norm
}

/// Splits a path into its parent path and final component, keeping the
/// component's original casing.
fn parent_and_name(path: &str) -> Result<(String, String), VolumeError> {
    let trimmed = path.trim_end_matches('/');
    let components: Vec<&str> = trimmed.split('/').filter(|c| !c.is_empty()).collect();
    let Some((name, parents)) = components.split_last() else {
        return Err(VolumeError::InvalidArgument("path has no final component"));
    };
    let mut parent = String::new();
    for component in parents {
        parent.push('/');
        parent.push_str(component);
    }
    if parent.is_empty() {
        parent.push('/');
    }
    Ok((parent, name.to_string()))
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn validate_name(name: &str) -> Result<(), VolumeError> {
    if name.is_empty() {
        return Err(VolumeError::InvalidArgument("name is empty"));
    }
    if name.contains(['/', '\0']) {
        return Err(VolumeError::InvalidArgument("name contains a path separator"));
    }
    if name == "." || name == ".." {
        return Err(VolumeError::InvalidArgument("name is reserved"));
    }
    if name.encode_utf16().count() > MAX_NAME_UNITS {
        return Err(VolumeError::InvalidArgument("name is too long"));
    }
    Ok(())
}
