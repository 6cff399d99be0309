use std::time::SystemTime;

use bitflags::bitflags;
use log::warn;

use crate::device::BlockDevice;
use crate::error::VolumeError;

use super::{FatFilesystem, table, time};

pub(crate) const DIR_ENTRY_SIZE: usize = 32;
/// First byte of a never-used slot; also ends the scan of its cluster.
pub(crate) const ENTRY_END: u8 = 0x00;
/// First byte of a deleted slot.
pub(crate) const ENTRY_DELETED: u8 = 0xE5;
/// Attribute byte marking a long-file-name fragment.
pub(crate) const ATTR_LFN: u8 = 0x0F;
/// Flag on the ordinal byte of the final (highest) LFN fragment.
const LFN_LAST: u8 = 0x40;
/// UCS-2 code units carried by one LFN fragment, at these byte offsets.
const LFN_UNITS: usize = 13;
const LFN_UNIT_OFFSETS: [usize; LFN_UNITS] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) struct FileAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// One file or directory, as returned by listing and lookup.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Long name when present, otherwise the trimmed 8.3 name.
    pub name: String,
    /// Normalised parent path joined with `name`.
    pub path: String,
    pub is_directory: bool,
    /// Size in bytes; always zero for directories.
    pub size: u64,
    pub last_modified: SystemTime,
    pub(crate) first_cluster: u32,
}

/// A raw 32-byte directory entry.
#[derive(Copy, Clone)]
pub(crate) struct RawDirEntry(pub(crate) [u8; DIR_ENTRY_SIZE]);

impl RawDirEntry {
    pub(crate) fn first_byte(&self) -> u8 {
        self.0[0]
    }

    pub(crate) fn attributes(&self) -> u8 {
        self.0[11]
    }

    pub(crate) fn is_lfn(&self) -> bool {
        self.attributes() == ATTR_LFN
    }

    pub(crate) fn is_volume_label(&self) -> bool {
        !self.is_lfn() && FileAttributes::from_bits_truncate(self.attributes())
            .contains(FileAttributes::VOLUME_ID)
    }

    pub(crate) fn is_directory(&self) -> bool {
        FileAttributes::from_bits_truncate(self.attributes()).contains(FileAttributes::DIRECTORY)
    }

    pub(crate) fn short_name_raw(&self) -> [u8; 11] {
        self.0[..11].try_into().unwrap()
    }

    /// The 8.3 name in display form: trimmed stem, then a dot and the
    /// trimmed extension when one exists.
    pub(crate) fn short_name_display(&self) -> String {
        display_8_3(&self.short_name_raw())
    }

    pub(crate) fn first_cluster(&self) -> u32 {
        let high = u16::from_le_bytes(self.0[20..22].try_into().unwrap()) as u32;
        let low = u16::from_le_bytes(self.0[26..28].try_into().unwrap()) as u32;
        (high << 16) | low
    }

    pub(crate) fn size(&self) -> u32 {
        u32::from_le_bytes(self.0[28..32].try_into().unwrap())
    }

    pub(crate) fn modified(&self) -> SystemTime {
        let time_raw = u16::from_le_bytes(self.0[22..24].try_into().unwrap());
        let date_raw = u16::from_le_bytes(self.0[24..26].try_into().unwrap());
        time::decode(date_raw, time_raw)
    }

    pub(crate) fn lfn_ordinal(&self) -> u8 {
        self.0[0]
    }

    pub(crate) fn lfn_checksum(&self) -> u8 {
        self.0[13]
    }

    /// Code units of an LFN fragment, truncated at the terminator.
    pub(crate) fn lfn_units(&self) -> Vec<u16> {
        let mut units = Vec::with_capacity(LFN_UNITS);
        for offset in LFN_UNIT_OFFSETS {
            let unit = u16::from_le_bytes(self.0[offset..offset + 2].try_into().unwrap());
            if unit == 0x0000 || unit == 0xFFFF {
                break;
            }
            units.push(unit);
        }
        units
    }

    pub(crate) fn new_short(
        name: [u8; 11],
        attributes: FileAttributes,
        first_cluster: u32,
        size: u32,
        date: u16,
        time: u16,
    ) -> Self {
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        entry[..11].copy_from_slice(&name);
        entry[11] = attributes.bits();
        // Creation stamp mirrors the modification stamp.
        entry[14..16].copy_from_slice(&time.to_le_bytes());
        entry[16..18].copy_from_slice(&date.to_le_bytes());
        entry[18..20].copy_from_slice(&date.to_le_bytes());
        entry[22..24].copy_from_slice(&time.to_le_bytes());
        entry[24..26].copy_from_slice(&date.to_le_bytes());
        let mut raw = Self(entry);
        raw.set_first_cluster(first_cluster);
        raw.set_size(size);
        raw
    }

    pub(crate) fn new_lfn(ordinal: u8, checksum: u8, units: &[u16]) -> Self {
        assert_eq!(units.len(), LFN_UNITS);
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        entry[0] = ordinal;
        entry[11] = ATTR_LFN;
        entry[13] = checksum;
        for (&offset, unit) in LFN_UNIT_OFFSETS.iter().zip(units) {
            entry[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
        }
        Self(entry)
    }

    pub(crate) fn set_first_cluster(&mut self, cluster: u32) {
        self.0[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        self.0[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    }

    pub(crate) fn set_size(&mut self, size: u32) {
        self.0[28..32].copy_from_slice(&size.to_le_bytes());
    }

    pub(crate) fn set_modified(&mut self, date: u16, time: u16) {
        self.0[22..24].copy_from_slice(&time.to_le_bytes());
        self.0[24..26].copy_from_slice(&date.to_le_bytes());
    }
}

/// Derives the 11-byte 8.3 name: stem and extension uppercased,
/// space-padded, characters outside the printable ASCII range replaced.
pub(crate) fn short_name(name: &str) -> [u8; 11] {
    let (stem, ext) = split_stem(name);
    let mut out = [b' '; 11];
    for (slot, byte) in out[..8].iter_mut().zip(short_name_bytes(stem)) {
        *slot = byte;
    }
    for (slot, byte) in out[8..].iter_mut().zip(short_name_bytes(ext)) {
        *slot = byte;
    }
    out
}

fn split_stem(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    }
}

fn short_name_bytes(part: &str) -> impl Iterator<Item = u8> + '_ {
    const INVALID: &[u8] = b".\"*+,/:;<=>?[\\]|";
    part.chars().filter(|c| *c != ' ').map(|c| {
        let upper = c.to_ascii_uppercase();
        if upper.is_ascii_graphic() && !INVALID.contains(&(upper as u8)) {
            upper as u8
        } else {
            b'_'
        }
    })
}

fn display_8_3(raw: &[u8; 11]) -> String {
    let stem = trim_ascii(&raw[..8]);
    let ext = trim_ascii(&raw[8..]);
    let mut name = String::from_utf8_lossy(stem).into_owned();
    if !ext.is_empty() {
        name.push('.');
        name.push_str(&String::from_utf8_lossy(ext));
    }
    name
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| *b != b' ').map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Checksum of the 8.3 name stored in every LFN fragment of its run.
pub(crate) fn lfn_checksum(short: &[u8; 11]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, &byte| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(byte))
}

/// Whether `name` survives the round trip through its own 8.3 form. Length
/// overflow, case changes and non-ASCII characters all force LFN emission so
/// listings reproduce the name exactly as created.
pub(crate) fn needs_lfn(name: &str) -> bool {
    let (stem, ext) = split_stem(name);
    stem.len() > 8 || ext.len() > 3 || display_8_3(&short_name(name)) != name
}

/// Builds the on-disk entry run for `name`: LFN fragments in reverse ordinal
/// order (when needed) followed by the 8.3 entry.
pub(crate) fn build_entries(
    name: &str,
    attributes: FileAttributes,
    first_cluster: u32,
    size: u32,
    now: SystemTime,
) -> Vec<RawDirEntry> {
    let short = short_name(name);
    let (date, time) = time::encode(now);
    let mut entries = Vec::new();

    if needs_lfn(name) {
        let units: Vec<u16> = name.encode_utf16().collect();
        let fragment_count = units.len().div_ceil(LFN_UNITS);
        let mut padded = units.clone();
        if padded.len() < fragment_count * LFN_UNITS {
            padded.push(0x0000);
        }
        padded.resize(fragment_count * LFN_UNITS, 0xFFFF);

        let checksum = lfn_checksum(&short);
        for ordinal in (1..=fragment_count).rev() {
            let mut byte = ordinal as u8;
            if ordinal == fragment_count {
                byte |= LFN_LAST;
            }
            let fragment = &padded[(ordinal - 1) * LFN_UNITS..ordinal * LFN_UNITS];
            entries.push(RawDirEntry::new_lfn(byte, checksum, fragment));
        }
    }

    entries.push(RawDirEntry::new_short(
        short,
        attributes,
        first_cluster,
        size,
        date,
        time,
    ));
    entries
}

/// A short entry produced by a directory scan, together with the slot range
/// of its LFN run.
pub(crate) struct ScannedEntry {
    /// Slot index of the 8.3 entry.
    pub(crate) index: usize,
    /// Slot index of the first entry of the run (equals `index` when the
    /// entry has no long name).
    pub(crate) run_start: usize,
    pub(crate) name: String,
    pub(crate) raw: RawDirEntry,
}

/// Walks the concatenated clusters of one directory, reassembling long
/// names. A `0x00` lead byte ends the current cluster only; the scan resumes
/// at the next cluster of the chain.
pub(crate) struct DirScanner<'a> {
    buf: &'a [u8],
    entries_per_cluster: usize,
    index: usize,
    lfn: Vec<u16>,
    lfn_checksum: Option<u8>,
    run_start: Option<usize>,
}

impl<'a> DirScanner<'a> {
    pub(crate) fn new(buf: &'a [u8], cluster_size: usize) -> Self {
        assert_eq!(buf.len() % cluster_size, 0);
        Self {
            buf,
            entries_per_cluster: cluster_size / DIR_ENTRY_SIZE,
            index: 0,
            lfn: Vec::new(),
            lfn_checksum: None,
            run_start: None,
        }
    }

    fn reset_lfn(&mut self) {
        self.lfn.clear();
        self.lfn_checksum = None;
        self.run_start = None;
    }

    pub(crate) fn next_entry(&mut self) -> Option<ScannedEntry> {
        while self.index * DIR_ENTRY_SIZE < self.buf.len() {
            let index = self.index;
            let offset = index * DIR_ENTRY_SIZE;
            let raw = RawDirEntry(self.buf[offset..offset + DIR_ENTRY_SIZE].try_into().unwrap());

            if raw.first_byte() == ENTRY_END {
                // End of this cluster; continue with the next one.
                self.index = (index / self.entries_per_cluster + 1) * self.entries_per_cluster;
                self.reset_lfn();
                continue;
            }
            self.index += 1;

            if raw.first_byte() == ENTRY_DELETED {
                self.reset_lfn();
                continue;
            }
            if raw.is_lfn() {
                if raw.lfn_ordinal() & LFN_LAST != 0 {
                    self.reset_lfn();
                    self.run_start = Some(index);
                    self.lfn_checksum = Some(raw.lfn_checksum());
                }
                // Fragments appear highest-ordinal first, so each one is
                // prepended to the accumulated units.
                let mut units = raw.lfn_units();
                units.extend_from_slice(&self.lfn);
                self.lfn = units;
                if self.run_start.is_none() {
                    self.run_start = Some(index);
                }
                continue;
            }
            if raw.is_volume_label() {
                self.reset_lfn();
                continue;
            }

            let name = if !self.lfn.is_empty() {
                let expected = lfn_checksum(&raw.short_name_raw());
                if self.lfn_checksum == Some(expected) {
                    String::from_utf16_lossy(&self.lfn)
                } else {
                    warn!("long-name checksum mismatch for {:?}", raw.short_name_display());
                    raw.short_name_display()
                }
            } else {
                raw.short_name_display()
            };
            let run_start = self.run_start.take().unwrap_or(index);
            self.reset_lfn();

            return Some(ScannedEntry {
                index,
                run_start,
                name,
                raw,
            });
        }
        None
    }
}

impl<D: BlockDevice> FatFilesystem<D> {
    /// Reads a directory's chain and full contents, one cluster per request.
    pub(crate) fn load_dir(&self, first_cluster: u32) -> Result<(Vec<u32>, Vec<u8>), VolumeError> {
        let chain = self.fat.chain(first_cluster)?;
        if chain.is_empty() {
            return Err(VolumeError::Corrupt("directory has no clusters"));
        }
        let cluster_size = self.boot.cluster_size() as usize;
        let mut buf = Vec::with_capacity(chain.len() * cluster_size);
        for &cluster in &chain {
            buf.extend_from_slice(&self.read_cluster(cluster)?);
        }
        Ok((chain, buf))
    }

    /// Writes back the directory cluster holding entry slots
    /// `[first_slot..=last_slot]`.
    fn store_dir_slots(
        &self,
        chain: &[u32],
        buf: &[u8],
        first_slot: usize,
        last_slot: usize,
    ) -> Result<(), VolumeError> {
        let per_cluster = self.boot.cluster_size() as usize / DIR_ENTRY_SIZE;
        let first_cluster_index = first_slot / per_cluster;
        let last_cluster_index = last_slot / per_cluster;
        let cluster_size = self.boot.cluster_size() as usize;
        for index in first_cluster_index..=last_cluster_index {
            let data = &buf[index * cluster_size..(index + 1) * cluster_size];
            self.write_cluster(chain[index], data)?;
        }
        Ok(())
    }

    /// Finds `needed` consecutive free or deleted slots, growing the
    /// directory by one zeroed cluster when none exist. Returns the chain,
    /// directory contents and the first slot of the run.
    fn free_slot_run(
        &self,
        dir_cluster: u32,
        needed: usize,
    ) -> Result<(Vec<u32>, Vec<u8>, usize), VolumeError> {
        let (mut chain, mut buf) = self.load_dir(dir_cluster)?;

        let mut run_start = None;
        let mut run_len = 0usize;
        for index in 0..buf.len() / DIR_ENTRY_SIZE {
            let lead = buf[index * DIR_ENTRY_SIZE];
            if lead == ENTRY_END || lead == ENTRY_DELETED {
                if run_len == 0 {
                    run_start = Some(index);
                }
                run_len += 1;
                if run_len == needed {
                    return Ok((chain, buf, run_start.unwrap()));
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }

        // No run. A trailing run of free slots, if any, reaches the end of
        // the last cluster; grow the directory until it is long enough.
        let cluster_size = self.boot.cluster_size() as usize;
        let slot = buf.len() / DIR_ENTRY_SIZE - run_len;
        let mut available = run_len;
        while available < needed {
            let new_cluster = self.fat.allocate(1)?[0];
            self.write_cluster(new_cluster, &vec![0u8; cluster_size])?;
            let last = *chain.last().unwrap();
            self.fat
                .set_entries(&[(last, new_cluster), (new_cluster, table::EOC_WRITE)])?;
            self.chains.remove(&dir_cluster);
            chain.push(new_cluster);
            buf.extend_from_slice(&vec![0u8; cluster_size]);
            available += cluster_size / DIR_ENTRY_SIZE;
        }
        Ok((chain, buf, slot))
    }

    /// Writes a freshly built entry run into the directory rooted at
    /// `dir_cluster`.
    pub(crate) fn insert_entries(
        &self,
        dir_cluster: u32,
        entries: &[RawDirEntry],
    ) -> Result<(), VolumeError> {
        let (chain, mut buf, slot) = self.free_slot_run(dir_cluster, entries.len())?;
        for (i, entry) in entries.iter().enumerate() {
            let offset = (slot + i) * DIR_ENTRY_SIZE;
            buf[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(&entry.0);
        }
        self.store_dir_slots(&chain, &buf, slot, slot + entries.len() - 1)
    }

    /// Locates `name` in the directory and returns the scan result.
    pub(crate) fn scan_for(
        &self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<(Vec<u32>, Vec<u8>, ScannedEntry)>, VolumeError> {
        let (chain, buf) = self.load_dir(dir_cluster)?;
        let wanted = name.to_lowercase();
        let mut scanner = DirScanner::new(&buf, self.boot.cluster_size() as usize);
        while let Some(entry) = scanner.next_entry() {
            if entry.name.to_lowercase() == wanted {
                drop(scanner);
                return Ok(Some((chain, buf, entry)));
            }
        }
        Ok(None)
    }

    /// Marks the 8.3 entry for `name` and its whole LFN run as deleted.
    pub(crate) fn erase_entry(&self, dir_cluster: u32, name: &str) -> Result<(), VolumeError> {
        let Some((chain, mut buf, entry)) = self.scan_for(dir_cluster, name)? else {
            return Err(VolumeError::NotFound(name.to_string()));
        };
        for slot in entry.run_start..=entry.index {
            buf[slot * DIR_ENTRY_SIZE] = ENTRY_DELETED;
        }
        self.store_dir_slots(&chain, &buf, entry.run_start, entry.index)
    }

    /// Rewrites the first-cluster, size and modification stamp of the 8.3
    /// entry for `name`, leaving its LFN run untouched.
    pub(crate) fn update_entry(
        &self,
        dir_cluster: u32,
        name: &str,
        first_cluster: u32,
        size: u32,
        modified: SystemTime,
    ) -> Result<(), VolumeError> {
        let Some((chain, mut buf, entry)) = self.scan_for(dir_cluster, name)? else {
            return Err(VolumeError::NotFound(name.to_string()));
        };
        let mut raw = entry.raw;
        raw.set_first_cluster(first_cluster);
        raw.set_size(size);
        let (date, time) = time::encode(modified);
        raw.set_modified(date, time);
        let offset = entry.index * DIR_ENTRY_SIZE;
        buf[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(&raw.0);
        self.store_dir_slots(&chain, &buf, entry.index, entry.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_derivation() {
        assert_eq!(&short_name("readme.txt"), b"README  TXT");
        assert_eq!(&short_name("a.b"), b"A       B  ");
        assert_eq!(&short_name("noext"), b"NOEXT      ");
        assert_eq!(&short_name("verylongstem.json"), b"VERYLONGJSO");
        assert_eq!(&short_name(".hidden"), b"_HIDDEN    ");
    }

    #[test]
    fn display_round_trip() {
        assert_eq!(display_8_3(b"README  TXT"), "README.TXT");
        assert_eq!(display_8_3(b"NOEXT      "), "NOEXT");
    }

    #[test]
    fn lfn_need_detection() {
        assert!(!needs_lfn("README.TXT"));
        assert!(!needs_lfn("A.B"));
        assert!(needs_lfn("readme.txt")); // case must survive listing
        assert!(needs_lfn("file-000000.txt"));
        assert!(needs_lfn("name with spaces.txt"));
        assert!(needs_lfn("测试.txt"));
    }

    #[test]
    fn build_entries_short_only() {
        let entries = build_entries(
            "HELLO.TXT",
            FileAttributes::ARCHIVE,
            9,
            123,
            SystemTime::now(),
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].first_cluster(), 9);
        assert_eq!(entries[0].size(), 123);
        assert_eq!(entries[0].short_name_display(), "HELLO.TXT");
    }

    #[test]
    fn build_entries_emits_reverse_ordinals() {
        // 15 characters need two LFN fragments.
        let entries = build_entries(
            "file-000000.txt",
            FileAttributes::ARCHIVE,
            3,
            0,
            SystemTime::now(),
        );
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].lfn_ordinal(), 2 | LFN_LAST);
        assert_eq!(entries[1].lfn_ordinal(), 1);
        assert!(entries[0].is_lfn());
        assert!(!entries[2].is_lfn());
        let checksum = lfn_checksum(&entries[2].short_name_raw());
        assert_eq!(entries[0].lfn_checksum(), checksum);
        assert_eq!(entries[1].lfn_checksum(), checksum);
    }

    #[test]
    fn scanner_reassembles_long_names() {
        let entries = build_entries(
            "A file with a long name.txt",
            FileAttributes::ARCHIVE,
            17,
            42,
            SystemTime::now(),
        );
        let mut buf = vec![0u8; 1024];
        for (i, entry) in entries.iter().enumerate() {
            buf[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE].copy_from_slice(&entry.0);
        }
        let mut scanner = DirScanner::new(&buf, 512);
        let found = scanner.next_entry().unwrap();
        assert_eq!(found.name, "A file with a long name.txt");
        assert_eq!(found.run_start, 0);
        assert_eq!(found.index, entries.len() - 1);
        assert_eq!(found.raw.first_cluster(), 17);
        assert!(scanner.next_entry().is_none());
    }

    #[test]
    fn scanner_skips_deleted_and_resumes_after_end_marker() {
        let entries = build_entries("HELLO.TXT", FileAttributes::ARCHIVE, 2, 0, SystemTime::now());
        let mut buf = vec![0u8; 1024];
        // Deleted entry, then a zero slot ending cluster 0; the live entry
        // sits in the second cluster.
        buf[0] = ENTRY_DELETED;
        buf[512..512 + DIR_ENTRY_SIZE].copy_from_slice(&entries[0].0);
        let mut scanner = DirScanner::new(&buf, 512);
        let found = scanner.next_entry().unwrap();
        assert_eq!(found.name, "HELLO.TXT");
        assert_eq!(found.index, 16);
    }

    #[test]
    fn unicode_name_survives_utf16_round_trip() {
        let name = "A file with a long name and unicode — 测试.txt";
        let entries = build_entries(name, FileAttributes::ARCHIVE, 5, 5, SystemTime::now());
        let mut buf = vec![0u8; 2048];
        for (i, entry) in entries.iter().enumerate() {
            buf[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE].copy_from_slice(&entry.0);
        }
        let mut scanner = DirScanner::new(&buf, 2048);
        assert_eq!(scanner.next_entry().unwrap().name, name);
    }
}
