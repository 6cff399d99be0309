use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::crypto::xts::SECTOR_SIZE;
use crate::device::BlockDevice;
use crate::error::VolumeError;
use crate::sector::SectorDevice;

use super::boot_sector::BootSector;

/// The 28 significant bits of a FAT32 entry.
pub(crate) const ENTRY_MASK: u32 = 0x0FFF_FFFF;
/// Entries at or above this value end a chain.
pub(crate) const EOC: u32 = 0x0FFF_FFF8;
/// The end-of-chain value this driver writes.
pub(crate) const EOC_WRITE: u32 = 0x0FFF_FFFF;
pub(crate) const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
/// Lowest valid data cluster.
pub(crate) const FIRST_CLUSTER: u32 = 2;

const CACHE_CAPACITY: usize = 256;
/// FAT sectors fetched in one run on a cache miss.
const PREFETCH_SECTORS: u32 = 32;
const ENTRIES_PER_SECTOR: u32 = (SECTOR_SIZE / 4) as u32;

/// The file allocation table: cached sector access, chain traversal, the
/// rolling-cursor allocator and dual-copy mutation.
///
/// Mutating entry points assume the volume-wide write lock is held; the
/// sector cache itself is guarded by its own short critical section.
pub(crate) struct Fat<D> {
    dev: Arc<SectorDevice<D>>,
    boot: Arc<BootSector>,
    cache: Mutex<HashMap<u32, Vec<u8>>>,
    alloc_hint: Mutex<u32>,
    free_clusters: Mutex<Option<u64>>,
}

impl<D: BlockDevice> Fat<D> {
    pub(crate) fn new(dev: Arc<SectorDevice<D>>, boot: Arc<BootSector>) -> Self {
        Self {
            dev,
            boot,
            cache: Mutex::new(HashMap::new()),
            alloc_hint: Mutex::new(FIRST_CLUSTER),
            free_clusters: Mutex::new(None),
        }
    }

    /// FAT entry for `cluster`, masked to its 28 significant bits.
    pub(crate) fn entry(&self, cluster: u32) -> Result<u32, VolumeError> {
        if cluster > self.boot.max_cluster() {
            return Err(VolumeError::Corrupt("FAT index out of range"));
        }
        let sector = cluster / ENTRIES_PER_SECTOR;
        let offset = (cluster % ENTRIES_PER_SECTOR) as usize * 4;
        let payload = self.fat_sector(sector)?;
        Ok(u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap()) & ENTRY_MASK)
    }

    /// One sector of the first FAT copy, via the cache. A miss fetches a
    /// whole prefetch run and installs every sector of it.
    fn fat_sector(&self, index: u32) -> Result<Vec<u8>, VolumeError> {
        if index >= self.boot.sectors_per_fat {
            return Err(VolumeError::Corrupt("FAT sector out of range"));
        }
        if let Some(hit) = self.cache.lock().unwrap().get(&index) {
            return Ok(hit.clone());
        }

        let run_start = index - index % PREFETCH_SECTORS;
        let run_len = PREFETCH_SECTORS.min(self.boot.sectors_per_fat - run_start);
        trace!("FAT cache miss at sector {index}, prefetching {run_len} sectors");
        let data = self
            .dev
            .read_sectors(self.boot.fat_start_sector() + run_start as u64, run_len as usize)?;

        let mut cache = self.cache.lock().unwrap();
        if cache.len() + run_len as usize > CACHE_CAPACITY {
            let victims: Vec<u32> = cache.keys().take(CACHE_CAPACITY / 4).copied().collect();
            for victim in victims {
                cache.remove(&victim);
            }
        }
        for (i, sector) in data.chunks_exact(SECTOR_SIZE).enumerate() {
            cache.insert(run_start + i as u32, sector.to_vec());
        }

        let offset = (index - run_start) as usize * SECTOR_SIZE;
        Ok(data[offset..offset + SECTOR_SIZE].to_vec())
    }

    /// Walks the chain starting at `first_cluster` until an end-of-chain or
    /// free/reserved entry.
    pub(crate) fn chain(&self, first_cluster: u32) -> Result<Vec<u32>, VolumeError> {
        let mut chain = Vec::new();
        let limit = self.boot.cluster_count() as usize;
        let mut cluster = first_cluster;
        while (FIRST_CLUSTER..EOC).contains(&cluster) {
            if cluster == BAD_CLUSTER {
                return Err(VolumeError::Corrupt("bad cluster in chain"));
            }
            if cluster > self.boot.max_cluster() {
                return Err(VolumeError::Corrupt("cluster chain leaves the volume"));
            }
            chain.push(cluster);
            if chain.len() > limit {
                return Err(VolumeError::Corrupt("cluster chain loops"));
            }
            cluster = self.entry(cluster)?;
        }
        Ok(chain)
    }

    /// Allocates `count` free clusters, scanning from the rolling hint and
    /// wrapping once. The cursor is left one past the last allocation.
    pub(crate) fn allocate(&self, count: usize) -> Result<Vec<u32>, VolumeError> {
        assert!(count > 0);
        let max = self.boot.max_cluster();
        let mut hint = self.alloc_hint.lock().unwrap();
        let start = (*hint).clamp(FIRST_CLUSTER, max);

        let mut found = Vec::with_capacity(count);
        let mut cluster = start;
        loop {
            if self.entry(cluster)? == 0 {
                found.push(cluster);
                if found.len() == count {
                    break;
                }
            }
            cluster += 1;
            if cluster > max {
                cluster = FIRST_CLUSTER;
            }
            if cluster == start {
                debug!("allocation of {count} clusters failed with {} free", found.len());
                return Err(VolumeError::DiskFull);
            }
        }

        let last = *found.last().unwrap();
        *hint = if last >= max { FIRST_CLUSTER } else { last + 1 };
        if let Some(free) = self.free_clusters.lock().unwrap().as_mut() {
            *free = free.saturating_sub(count as u64);
        }
        trace!("allocated {count} clusters starting at {}", found[0]);
        Ok(found)
    }

    /// Links `clusters` into one chain terminated with end-of-chain and
    /// writes the affected FAT sectors to both copies.
    pub(crate) fn write_chain(&self, clusters: &[u32]) -> Result<(), VolumeError> {
        let mut updates: Vec<(u32, u32)> = clusters
            .windows(2)
            .map(|pair| (pair[0], pair[1]))
            .collect();
        if let Some(&last) = clusters.last() {
            updates.push((last, EOC_WRITE));
        }
        self.set_entries(&updates)
    }

    /// Applies entry updates, batching by FAT sector. Every modified sector
    /// is written to both FAT copies and refreshed in the cache. The four
    /// reserved high bits of each entry are preserved.
    pub(crate) fn set_entries(&self, updates: &[(u32, u32)]) -> Result<(), VolumeError> {
        let mut by_sector: HashMap<u32, Vec<(usize, u32)>> = HashMap::new();
        for &(cluster, value) in updates {
            if cluster > self.boot.max_cluster() {
                return Err(VolumeError::Corrupt("FAT update out of range"));
            }
            let sector = cluster / ENTRIES_PER_SECTOR;
            let offset = (cluster % ENTRIES_PER_SECTOR) as usize * 4;
            by_sector.entry(sector).or_default().push((offset, value));
        }

        for (sector, edits) in by_sector {
            let mut payload = self.fat_sector(sector)?;
            for (offset, value) in edits {
                let old = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap());
                let merged = (old & !ENTRY_MASK) | (value & ENTRY_MASK);
                payload[offset..offset + 4].copy_from_slice(&merged.to_le_bytes());
            }
            for copy in 0..self.boot.number_of_fats {
                let absolute = self.boot.fat_start_sector()
                    + copy as u64 * self.boot.sectors_per_fat as u64
                    + sector as u64;
                self.dev.write_sectors(absolute, &payload)?;
            }
            self.cache.lock().unwrap().insert(sector, payload);
        }
        Ok(())
    }

    /// Frees the chain starting at `first_cluster` and returns the freed
    /// clusters. The whole chain is read before any entry is overwritten.
    pub(crate) fn free_chain(&self, first_cluster: u32) -> Result<Vec<u32>, VolumeError> {
        let clusters = self.chain(first_cluster)?;
        let updates: Vec<(u32, u32)> = clusters.iter().map(|&c| (c, 0)).collect();
        self.set_entries(&updates)?;
        if let Some(free) = self.free_clusters.lock().unwrap().as_mut() {
            *free += clusters.len() as u64;
        }
        trace!("freed {} clusters starting at {first_cluster}", clusters.len());
        Ok(clusters)
    }

    /// Number of free clusters, scanning the FAT once and serving later
    /// calls from the maintained count.
    pub(crate) fn free_cluster_count(&self) -> Result<u64, VolumeError> {
        if let Some(count) = *self.free_clusters.lock().unwrap() {
            return Ok(count);
        }
        let mut free = 0u64;
        for cluster in FIRST_CLUSTER..=self.boot.max_cluster() {
            if self.entry(cluster)? == 0 {
                free += 1;
            }
        }
        debug!("free-cluster scan found {free} free clusters");
        *self.free_clusters.lock().unwrap() = Some(free);
        Ok(free)
    }

    pub(crate) fn invalidate_free_count(&self) {
        *self.free_clusters.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::xts::Xts;
    use crate::device::MemDevice;

    /// Tiny volume: 1 reserved sector, two 2-sector FATs, 59 data clusters
    /// of one sector each.
    fn test_fat() -> Fat<MemDevice> {
        let boot = Arc::new(BootSector {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            number_of_fats: 2,
            total_sectors: 64,
            sectors_per_fat: 2,
            root_dir_first_cluster: 2,
            volume_label: *b"TEST       ",
            fs_type: *b"FAT32   ",
        });
        let xts = Xts::new(&[9u8; 64]).unwrap();
        let dev = Arc::new(SectorDevice::new(
            MemDevice::new(64 * SECTOR_SIZE),
            xts,
            0,
            64 * SECTOR_SIZE as u64,
        ));
        // Zero both FAT copies through the encrypted view.
        dev.write_sectors(1, &vec![0u8; 4 * SECTOR_SIZE]).unwrap();
        Fat::new(dev, boot)
    }

    #[test]
    fn allocate_chain_and_free() {
        let fat = test_fat();
        assert_eq!(fat.free_cluster_count().unwrap(), 59);

        let clusters = fat.allocate(3).unwrap();
        assert_eq!(clusters, vec![2, 3, 4]);
        fat.write_chain(&clusters).unwrap();
        assert_eq!(fat.free_cluster_count().unwrap(), 56);

        assert_eq!(fat.chain(2).unwrap(), vec![2, 3, 4]);
        assert_eq!(fat.entry(2).unwrap(), 3);
        assert!(fat.entry(4).unwrap() >= EOC);

        let freed = fat.free_chain(2).unwrap();
        assert_eq!(freed, vec![2, 3, 4]);
        assert_eq!(fat.free_cluster_count().unwrap(), 59);
        assert_eq!(fat.entry(2).unwrap(), 0);
    }

    #[test]
    fn allocator_advances_and_wraps() {
        let fat = test_fat();
        let first = fat.allocate(2).unwrap();
        fat.write_chain(&first).unwrap();
        let second = fat.allocate(2).unwrap();
        assert_eq!(second, vec![4, 5]);
        fat.write_chain(&second).unwrap();
        // Free the first pair; the cursor sits past both, so the next
        // allocation wraps around to reuse it.
        fat.free_chain(2).unwrap();
        let third = fat.allocate(57).unwrap();
        assert!(third.contains(&2));
        assert!(third.contains(&3));
    }

    #[test]
    fn exhaustion_is_disk_full() {
        let fat = test_fat();
        assert!(matches!(fat.allocate(60), Err(VolumeError::DiskFull)));
    }

    #[test]
    fn both_fat_copies_are_written() {
        let fat = test_fat();
        let clusters = fat.allocate(2).unwrap();
        fat.write_chain(&clusters).unwrap();
        let copy1 = fat.dev.read_sector(1).unwrap();
        let copy2 = fat.dev.read_sector(3).unwrap();
        assert_eq!(copy1, copy2);
        assert_eq!(u32::from_le_bytes(copy1[8..12].try_into().unwrap()) & ENTRY_MASK, 3);
    }
}
