use std::time::{SystemTime, UNIX_EPOCH};

use derive_builder::Builder;
use log::debug;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::crypto::kdf::SALT_LEN;
use crate::crypto::keyfile::Keyfile;
use crate::crypto::xts::{SECTOR_SIZE, Xts};
use crate::device::BlockDevice;
use crate::error::VolumeError;
use crate::header::{
    BACKUP_GROUP_LEN, DATA_AREA_OFFSET, FORMAT_VERSION, MIN_PROGRAM_VERSION, VolumeHeader,
};
use crate::sector::SectorDevice;

/// Smallest container this crate will create: both leading header groups,
/// the backup group, and a minimal FAT32 data area.
pub const MIN_VOLUME_SIZE: u64 = 512 * 1024;

const DEFAULT_LABEL: [u8; 11] = *b"NO NAME    ";
const DEFAULT_SECTORS_PER_CLUSTER: u8 = 8;
const RESERVED_SECTORS: u16 = 32;
const NUMBER_OF_FATS: u8 = 2;

/// Options for creating a new container.
#[derive(Builder, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct CreateVolumeOptions {
    /// Total size of the container in bytes; must equal the device size.
    pub total_size: u64,
    /// Volume password as UTF-8 bytes.
    pub password: Vec<u8>,
    /// Personal iterations multiplier; `0` selects the default schedule.
    #[builder(default)]
    pub pim: u32,
    #[builder(default)]
    pub keyfiles: Vec<Keyfile>,
    /// Sectors per data cluster; the default of 8 gives 4 KiB clusters.
    #[builder(default = DEFAULT_SECTORS_PER_CLUSTER)]
    pub sectors_per_cluster: u8,
    #[builder(default = DEFAULT_LABEL)]
    pub volume_label: [u8; 11],
}

impl CreateVolumeOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(total_size) = self.total_size {
            if total_size % SECTOR_SIZE as u64 != 0 {
                return Err("Total size must be a multiple of 512.".to_string());
            }
            if total_size < MIN_VOLUME_SIZE {
                return Err(format!("Total size must be at least {MIN_VOLUME_SIZE} bytes."));
            }
        }
        if let Some(sectors_per_cluster) = self.sectors_per_cluster {
            if sectors_per_cluster == 0
                || !sectors_per_cluster.is_power_of_two()
                || sectors_per_cluster > 128
            {
                return Err("Sectors per cluster must be a power of two, at most 128.".to_string());
            }
        }
        Ok(())
    }
}

/// Creates a new container on `device`: header pair, backup header and a
/// fresh FAT32 filesystem in the encrypted data area.
pub fn create_volume<D: BlockDevice>(
    device: &D,
    options: &CreateVolumeOptions,
) -> Result<(), VolumeError> {
    if device.len()? != options.total_size {
        return Err(VolumeError::InvalidArgument(
            "device size does not match the requested volume size",
        ));
    }
    let data_size = options.total_size - DATA_AREA_OFFSET - BACKUP_GROUP_LEN;

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut master_keydata = Zeroizing::new([0u8; 256]);
    OsRng.fill_bytes(&mut master_keydata[..]);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let header = VolumeHeader {
        version: FORMAT_VERSION,
        min_program_version: MIN_PROGRAM_VERSION,
        volume_creation_time: now,
        header_creation_time: now,
        hidden_volume_size: 0,
        data_area_size: data_size,
        data_area_offset: DATA_AREA_OFFSET,
        encrypted_area_length: data_size,
        flags: 0,
        sector_size: SECTOR_SIZE as u32,
        master_keydata: *master_keydata,
    };

    let record = header.encrypt(&options.password, options.pim, &options.keyfiles, &salt)?;
    device.write_at(0, &record)?;
    // The same record serves as the backup header at the end of the
    // container; the rest of each header group is left as found.
    device.write_at(options.total_size - BACKUP_GROUP_LEN, &record)?;

    let xts = Xts::new(header.master_key())?;
    let sectors = SectorDevice::new(device, xts, DATA_AREA_OFFSET, data_size);
    write_filesystem(&sectors, options)?;

    debug!(
        "created container: {} bytes total, {data_size} bytes data area",
        options.total_size
    );
    Ok(())
}

/// Writes the initial FAT32 filesystem through the encrypted sector view:
/// boot sector, FSInfo, signed reserved sectors, backup boot region, both
/// FAT copies and a zeroed root cluster.
fn write_filesystem<D: BlockDevice>(
    dev: &SectorDevice<D>,
    options: &CreateVolumeOptions,
) -> Result<(), VolumeError> {
    let total_sectors = dev.sector_count();
    let reserved = RESERVED_SECTORS as u64;
    let sectors_per_cluster = options.sectors_per_cluster as u64;
    if total_sectors > u32::MAX as u64 || total_sectors < reserved + 16 * sectors_per_cluster {
        return Err(VolumeError::InvalidArgument(
            "data area cannot hold a FAT32 filesystem",
        ));
    }

    let approx_clusters = (total_sectors - reserved) / sectors_per_cluster;
    let fat_sectors = ((approx_clusters + 2) * 4).div_ceil(SECTOR_SIZE as u64);
    let cluster_count =
        (total_sectors - reserved - NUMBER_OF_FATS as u64 * fat_sectors) / sectors_per_cluster;

    let mut boot = [0u8; SECTOR_SIZE];
    boot[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    boot[3..11].copy_from_slice(b"MSDOS5.0");
    write_u16(&mut boot, 11, SECTOR_SIZE as u16);
    boot[13] = options.sectors_per_cluster;
    write_u16(&mut boot, 14, RESERVED_SECTORS);
    boot[16] = NUMBER_OF_FATS;
    // Root entry count and the 16-bit totals stay zero on FAT32.
    boot[21] = 0xF8;
    write_u16(&mut boot, 24, 32);
    write_u16(&mut boot, 26, 64);
    write_u32(&mut boot, 32, total_sectors as u32);
    write_u32(&mut boot, 36, fat_sectors as u32);
    write_u32(&mut boot, 44, 2);
    write_u16(&mut boot, 48, 1);
    write_u16(&mut boot, 50, 6);
    boot[64] = 0x80;
    boot[66] = 0x29;
    write_u32(&mut boot, 67, OsRng.next_u32());
    boot[71..82].copy_from_slice(&options.volume_label);
    boot[82..90].copy_from_slice(b"FAT32   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;

    let mut fsinfo = [0u8; SECTOR_SIZE];
    write_u32(&mut fsinfo, 0, 0x4161_5252);
    write_u32(&mut fsinfo, 484, 0x6141_7272);
    // Cluster 2 is taken by the root directory.
    write_u32(&mut fsinfo, 488, (cluster_count - 1) as u32);
    write_u32(&mut fsinfo, 492, 3);
    write_u32(&mut fsinfo, 508, 0xAA55_0000);

    let mut signed = [0u8; SECTOR_SIZE];
    signed[510] = 0x55;
    signed[511] = 0xAA;

    dev.write_sectors(0, &boot)?;
    dev.write_sectors(1, &fsinfo)?;
    for sector in 2..=5 {
        dev.write_sectors(sector, &signed)?;
    }
    dev.write_sectors(6, &boot)?;
    dev.write_sectors(7, &fsinfo)?;
    dev.write_sectors(8, &vec![0u8; (reserved as usize - 8) * SECTOR_SIZE])?;

    // Both FAT copies: media and reserved entries, root end-of-chain, the
    // rest zeroed in bounded chunks.
    let mut fat_first = [0u8; SECTOR_SIZE];
    write_u32(&mut fat_first, 0, 0x0FFF_FFF8);
    write_u32(&mut fat_first, 4, 0x0FFF_FFFF);
    write_u32(&mut fat_first, 8, 0x0FFF_FFFF);
    let zero_chunk = vec![0u8; 256 * SECTOR_SIZE];
    for copy in 0..NUMBER_OF_FATS as u64 {
        let start = reserved + copy * fat_sectors;
        dev.write_sectors(start, &fat_first)?;
        let mut written = 1u64;
        while written < fat_sectors {
            let chunk = (fat_sectors - written).min(256);
            dev.write_sectors(start + written, &zero_chunk[..chunk as usize * SECTOR_SIZE])?;
            written += chunk;
        }
    }

    // Zeroed root directory cluster.
    let first_data_sector = reserved + NUMBER_OF_FATS as u64 * fat_sectors;
    dev.write_sectors(
        first_data_sector,
        &vec![0u8; sectors_per_cluster as usize * SECTOR_SIZE],
    )?;

    debug!("formatted FAT32 data area: {cluster_count} clusters, {fat_sectors} FAT sectors");
    Ok(())
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn builder_validates_sizes() {
        assert!(
            CreateVolumeOptionsBuilder::default()
                .total_size(MIN_VOLUME_SIZE + 100) // not sector aligned
                .password(b"pw".to_vec())
                .build()
                .is_err()
        );
        assert!(
            CreateVolumeOptionsBuilder::default()
                .total_size(64 * 1024)
                .password(b"pw".to_vec())
                .build()
                .is_err()
        );
        assert!(
            CreateVolumeOptionsBuilder::default()
                .total_size(MIN_VOLUME_SIZE)
                .password(b"pw".to_vec())
                .sectors_per_cluster(3)
                .build()
                .is_err()
        );
    }

    #[test]
    fn device_size_must_match() {
        let device = MemDevice::new(MIN_VOLUME_SIZE as usize);
        let options = CreateVolumeOptionsBuilder::default()
            .total_size(2 * MIN_VOLUME_SIZE)
            .password(b"pw".to_vec())
            .pim(1)
            .build()
            .unwrap();
        assert!(matches!(
            create_volume(&device, &options),
            Err(VolumeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn header_records_are_written_in_both_places() {
        let size = 1024 * 1024;
        let device = MemDevice::new(size);
        let options = CreateVolumeOptionsBuilder::default()
            .total_size(size as u64)
            .password(b"pw".to_vec())
            .pim(1)
            .build()
            .unwrap();
        create_volume(&device, &options).unwrap();

        let mut primary = [0u8; 512];
        let mut backup = [0u8; 512];
        device.read_at(0, &mut primary).unwrap();
        device
            .read_at(size as u64 - BACKUP_GROUP_LEN, &mut backup)
            .unwrap();
        assert_eq!(primary, backup);
        assert_ne!(primary, [0u8; 512]);
    }
}
