use std::io::{self, Read, Write};
use std::time::SystemTime;

use log::{debug, trace};

use crate::device::BlockDevice;
use crate::error::VolumeError;

use super::{FatFilesystem, FileEntry, dir, normalize, parent_and_name, validate_name};

/// Cap on one coalesced read request for whole-file and streaming reads.
const MAX_READ_RUN: u32 = 256;
/// Tighter cap for ranged reads, which tend to be random access.
const MAX_RANGE_RUN: u32 = 64;
/// Clusters gathered per batch during a streaming write.
const WRITE_BATCH_CLUSTERS: usize = 64;

/// A run of physically consecutive clusters.
struct Run {
    first: u32,
    len: u32,
}

/// Coalesces a chain into consecutive runs, each at most `cap` clusters.
fn coalesce(chain: &[u32], cap: u32) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for &cluster in chain {
        match runs.last_mut() {
            Some(run) if run.first + run.len == cluster && run.len < cap => run.len += 1,
            _ => runs.push(Run { first: cluster, len: 1 }),
        }
    }
    runs
}

impl<D: BlockDevice> FatFilesystem<D> {
    fn file_entry(&self, path: &str) -> Result<FileEntry, VolumeError> {
        let entry = self.resolve(path)?;
        if entry.is_directory {
            return Err(VolumeError::NotAFile(path.to_string()));
        }
        Ok(entry)
    }

    /// Reads a whole file.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, VolumeError> {
        let entry = self.file_entry(path)?;
        let chain = self.chain_of(entry.first_cluster)?;
        self.read_chain_data(&chain, entry.size, MAX_READ_RUN)
    }

    fn read_chain_data(
        &self,
        chain: &[u32],
        size: u64,
        cap: u32,
    ) -> Result<Vec<u8>, VolumeError> {
        let sectors_per_cluster = self.boot.sectors_per_cluster as usize;
        let mut data = Vec::with_capacity(size as usize);
        for run in coalesce(chain, cap) {
            if data.len() as u64 >= size {
                break;
            }
            let bytes = self.dev.read_sectors(
                self.boot.sector_of_cluster(run.first),
                run.len as usize * sectors_per_cluster,
            )?;
            let remaining = (size - data.len() as u64) as usize;
            data.extend_from_slice(&bytes[..bytes.len().min(remaining)]);
        }
        if (data.len() as u64) < size {
            return Err(VolumeError::Corrupt("cluster chain shorter than file size"));
        }
        Ok(data)
    }

    /// Reads `length` bytes starting at `offset`, touching only the clusters
    /// that overlap the range. The result is clamped to the end of the file.
    pub fn read_range(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, VolumeError> {
        let entry = self.file_entry(path)?;
        if length == 0 || offset >= entry.size {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(length).min(entry.size);
        let cluster_size = self.boot.cluster_size() as u64;
        let first_index = (offset / cluster_size) as usize;
        let last_index = ((end - 1) / cluster_size) as usize;

        let chain = self.chain_of(entry.first_cluster)?;
        if last_index >= chain.len() {
            return Err(VolumeError::Corrupt("cluster chain shorter than file size"));
        }
        let window = &chain[first_index..=last_index];
        let window_size = window.len() as u64 * cluster_size;
        let data = self.read_chain_data(window, window_size, MAX_RANGE_RUN)?;

        let skip = (offset - first_index as u64 * cluster_size) as usize;
        let take = (end - offset) as usize;
        Ok(data[skip..skip + take].to_vec())
    }

    /// Streams a file into `sink` run by run without materialising it. A
    /// sink that closes early ends the stream silently; the return value is
    /// the number of bytes actually delivered.
    pub fn stream(&self, path: &str, sink: &mut dyn Write) -> Result<u64, VolumeError> {
        let entry = self.file_entry(path)?;
        let chain = self.chain_of(entry.first_cluster)?;
        let sectors_per_cluster = self.boot.sectors_per_cluster as usize;

        let mut delivered = 0u64;
        let mut remaining = entry.size;
        for run in coalesce(&chain, MAX_READ_RUN) {
            if remaining == 0 {
                break;
            }
            let bytes = self.dev.read_sectors(
                self.boot.sector_of_cluster(run.first),
                run.len as usize * sectors_per_cluster,
            )?;
            let take = bytes.len().min(remaining as usize);
            match sink.write_all(&bytes[..take]) {
                Ok(()) => {
                    delivered += take as u64;
                    remaining -= take as u64;
                }
                Err(err) if sink_closed(&err) => {
                    debug!("stream sink closed after {delivered} bytes");
                    return Ok(delivered);
                }
                Err(err) => return Err(err.into()),
            }
        }
        if remaining > 0 {
            return Err(VolumeError::Corrupt("cluster chain shorter than file size"));
        }
        match sink.flush() {
            Ok(()) => {}
            Err(err) if sink_closed(&err) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(delivered)
    }

    /// Writes a whole file, creating the entry when it does not exist and
    /// replacing any previous contents.
    pub fn write(&self, path: &str, data: &[u8]) -> Result<(), VolumeError> {
        let _write = self.write_lock.lock().unwrap();
        let result = self.write_locked(path, data);
        if result.is_err() {
            self.fat.invalidate_free_count();
        }
        result
    }

    fn write_locked(&self, path: &str, data: &[u8]) -> Result<(), VolumeError> {
        if data.len() as u64 > u32::MAX as u64 {
            return Err(VolumeError::InvalidArgument("file too large for FAT32"));
        }
        let (parent, name) = self.prepare_write_target(path)?;
        let cluster_size = self.boot.cluster_size() as u64;
        let count = (data.len() as u64).div_ceil(cluster_size).max(1) as usize;
        let clusters = self.fat.allocate(count)?;
        self.fat.write_chain(&clusters)?;
        self.write_cluster_data(&clusters, data)?;
        self.update_entry(
            parent.first_cluster,
            &name,
            clusters[0],
            data.len() as u32,
            SystemTime::now(),
        )?;
        self.finish_write(path, &parent, clusters[0]);
        Ok(())
    }

    /// Writes a file of known size from a reader, gathering up to 64
    /// clusters per batch and issuing one multi-sector write per physically
    /// contiguous run.
    pub fn write_streaming(
        &self,
        path: &str,
        source: &mut dyn Read,
        size: u64,
        mut progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<(), VolumeError> {
        let _write = self.write_lock.lock().unwrap();
        let result = self.write_streaming_locked(path, source, size, &mut progress);
        if result.is_err() {
            self.fat.invalidate_free_count();
        }
        result
    }

    fn write_streaming_locked(
        &self,
        path: &str,
        source: &mut dyn Read,
        size: u64,
        progress: &mut Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<(), VolumeError> {
        if size > u32::MAX as u64 {
            return Err(VolumeError::InvalidArgument("file too large for FAT32"));
        }
        let (parent, name) = self.prepare_write_target(path)?;
        let cluster_size = self.boot.cluster_size() as u64;
        let count = size.div_ceil(cluster_size).max(1) as usize;
        let clusters = self.fat.allocate(count)?;
        self.fat.write_chain(&clusters)?;

        let mut written = 0u64;
        let mut index = 0usize;
        while written < size {
            let batch = &clusters[index..clusters.len().min(index + WRITE_BATCH_CLUSTERS)];
            let batch_capacity = batch.len() as u64 * cluster_size;
            let want = batch_capacity.min(size - written) as usize;

            let mut scratch = vec![0u8; batch_capacity as usize];
            source
                .read_exact(&mut scratch[..want])
                .map_err(VolumeError::from)?;
            self.write_cluster_data(batch, &scratch)?;

            written += want as u64;
            index += batch.len();
            if let Some(callback) = progress.as_mut() {
                callback(written, size);
            }
        }
        if let Some(callback) = progress.as_mut() {
            callback(written, size);
        }

        self.update_entry(
            parent.first_cluster,
            &name,
            clusters[0],
            size as u32,
            SystemTime::now(),
        )?;
        self.finish_write(path, &parent, clusters[0]);
        Ok(())
    }

    /// Resolves the parent, frees the previous chain of an existing target
    /// and creates a fresh zero-length entry when there is none.
    fn prepare_write_target(&self, path: &str) -> Result<(FileEntry, String), VolumeError> {
        let (parent_path, name) = parent_and_name(path)?;
        let parent = self.resolve(&parent_path)?;
        if !parent.is_directory {
            return Err(VolumeError::NotADirectory(parent_path));
        }
        match self.find_in(&parent, &name)? {
            Some(existing) if existing.is_directory => {
                Err(VolumeError::NotAFile(path.to_string()))
            }
            Some(existing) => {
                if existing.first_cluster != 0 {
                    self.fat.free_chain(existing.first_cluster)?;
                    self.chains.remove(&existing.first_cluster);
                }
                Ok((parent, name))
            }
            None => {
                validate_name(&name)?;
                let entries = dir::build_entries(
                    &name,
                    dir::FileAttributes::ARCHIVE,
                    0,
                    0,
                    SystemTime::now(),
                );
                self.insert_entries(parent.first_cluster, &entries)?;
                Ok((parent, name))
            }
        }
    }

    /// Writes payload bytes across an ordered cluster list, one request per
    /// contiguous run; the final partial cluster is zero-padded.
    fn write_cluster_data(&self, clusters: &[u32], data: &[u8]) -> Result<(), VolumeError> {
        let cluster_size = self.boot.cluster_size() as usize;
        let mut offset = 0usize;
        for run in coalesce(clusters, MAX_READ_RUN) {
            let run_bytes = run.len as usize * cluster_size;
            let sector = self.boot.sector_of_cluster(run.first);
            let available = data.len().saturating_sub(offset);
            if available >= run_bytes {
                self.dev.write_sectors(sector, &data[offset..offset + run_bytes])?;
            } else {
                let mut scratch = vec![0u8; run_bytes];
                scratch[..available].copy_from_slice(&data[offset..]);
                self.dev.write_sectors(sector, &scratch)?;
            }
            offset += run_bytes;
        }
        trace!("wrote {} bytes over {} clusters", data.len(), clusters.len());
        Ok(())
    }

    fn finish_write(&self, path: &str, parent: &FileEntry, first_cluster: u32) {
        self.chains.remove(&first_cluster);
        self.invalidate_listing(&normalize(&parent.path));
        self.invalidate_entry(&normalize(path));
    }
}

fn sink_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::WriteZero
    )
}
