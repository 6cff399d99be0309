use bitflags::bitflags;
use log::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::kdf::{self, SALT_LEN, VolumeKind};
use crate::crypto::keyfile::{self, Keyfile};
use crate::crypto::xts::Xts;
use crate::error::VolumeError;

/// Size of one header record on disk: salt followed by the encrypted
/// payload.
pub const HEADER_LEN: usize = 512;
/// Size of the encrypted header payload.
pub(crate) const PAYLOAD_LEN: usize = HEADER_LEN - SALT_LEN;
/// Each of the two leading header groups reserves this much space.
pub const HEADER_GROUP_LEN: u64 = 64 * 1024;
/// Byte offset of the data area in a normal volume.
pub const DATA_AREA_OFFSET: u64 = 2 * HEADER_GROUP_LEN;
/// Space reserved at the end of the container for the backup header group.
pub const BACKUP_GROUP_LEN: u64 = 2 * HEADER_GROUP_LEN;

const MAGIC: &[u8; 4] = b"VERA";
/// Header layout version written on create.
pub(crate) const FORMAT_VERSION: u16 = 5;
/// Lowest program version able to read volumes this crate creates (1.11).
pub(crate) const MIN_PROGRAM_VERSION: u16 = 0x010b;

// Offsets within the decrypted 448-byte payload. Every multi-byte field is
// big-endian.
const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const MIN_VERSION_OFFSET: usize = 6;
const KEY_CRC_OFFSET: usize = 8;
const VOLUME_CTIME_OFFSET: usize = 12;
const HEADER_CTIME_OFFSET: usize = 20;
const HIDDEN_SIZE_OFFSET: usize = 28;
const DATA_SIZE_OFFSET: usize = 36;
const DATA_START_OFFSET: usize = 44;
const ENCRYPTED_LEN_OFFSET: usize = 52;
const FLAGS_OFFSET: usize = 60;
const SECTOR_SIZE_OFFSET: usize = 64;
const HEADER_CRC_OFFSET: usize = 188;
const KEY_AREA_OFFSET: usize = 192;
const KEY_AREA_LEN: usize = 256;

bitflags! {
    /// Volume flag bits stored in the header.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        const SYSTEM_ENCRYPTION = 1 << 0;
        const NON_SYSTEM_IN_PLACE = 1 << 1;
    }
}

/// Decrypted volume header.
///
/// The on-disk form is a 64-byte random salt followed by 448 bytes encrypted
/// as a single XTS unit (number 0) under the key derived from the password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeHeader {
    pub version: u16,
    pub min_program_version: u16,
    pub volume_creation_time: u64,
    pub header_creation_time: u64,
    pub hidden_volume_size: u64,
    /// Size of the data area in bytes.
    pub data_area_size: u64,
    /// Byte offset of the data area within the container.
    pub data_area_offset: u64,
    pub encrypted_area_length: u64,
    pub flags: u32,
    pub sector_size: u32,
    /// Raw key area; the first 64 bytes are the AES-256 XTS master key.
    pub master_keydata: [u8; KEY_AREA_LEN],
}

impl VolumeHeader {
    /// The 64-byte XTS master key for the data area.
    pub fn master_key(&self) -> &[u8] {
        &self.master_keydata[..64]
    }

    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags)
    }

    /// Parses and validates an already decrypted payload. Magic or CRC
    /// mismatches all collapse into [`VolumeError::AuthFailed`] so a wrong
    /// password and a damaged header are indistinguishable.
    pub(crate) fn parse(payload: &[u8; PAYLOAD_LEN]) -> Result<Self, VolumeError> {
        if payload[MAGIC_OFFSET..MAGIC_OFFSET + 4] != *MAGIC {
            return Err(VolumeError::AuthFailed);
        }
        let key_crc = read_u32(payload, KEY_CRC_OFFSET);
        if key_crc != crc32fast::hash(&payload[KEY_AREA_OFFSET..]) {
            return Err(VolumeError::AuthFailed);
        }
        let header_crc = read_u32(payload, HEADER_CRC_OFFSET);
        if header_crc != crc32fast::hash(&payload[..HEADER_CRC_OFFSET]) {
            return Err(VolumeError::AuthFailed);
        }

        let sector_size = read_u32(payload, SECTOR_SIZE_OFFSET);
        if !(512..=4096).contains(&sector_size) || sector_size % 512 != 0 {
            return Err(VolumeError::Corrupt("invalid sector size in header"));
        }

        let mut master_keydata = [0u8; KEY_AREA_LEN];
        master_keydata.copy_from_slice(&payload[KEY_AREA_OFFSET..]);

        Ok(Self {
            version: read_u16(payload, VERSION_OFFSET),
            min_program_version: read_u16(payload, MIN_VERSION_OFFSET),
            volume_creation_time: read_u64(payload, VOLUME_CTIME_OFFSET),
            header_creation_time: read_u64(payload, HEADER_CTIME_OFFSET),
            hidden_volume_size: read_u64(payload, HIDDEN_SIZE_OFFSET),
            data_area_size: read_u64(payload, DATA_SIZE_OFFSET),
            data_area_offset: read_u64(payload, DATA_START_OFFSET),
            encrypted_area_length: read_u64(payload, ENCRYPTED_LEN_OFFSET),
            flags: read_u32(payload, FLAGS_OFFSET),
            sector_size,
            master_keydata,
        })
    }

    /// Serialises the header into payload form, computing both CRCs.
    pub(crate) fn to_payload(&self) -> Zeroizing<[u8; PAYLOAD_LEN]> {
        let mut payload = Zeroizing::new([0u8; PAYLOAD_LEN]);
        payload[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(MAGIC);
        write_u16(&mut payload[..], VERSION_OFFSET, self.version);
        write_u16(&mut payload[..], MIN_VERSION_OFFSET, self.min_program_version);
        write_u64(&mut payload[..], VOLUME_CTIME_OFFSET, self.volume_creation_time);
        write_u64(&mut payload[..], HEADER_CTIME_OFFSET, self.header_creation_time);
        write_u64(&mut payload[..], HIDDEN_SIZE_OFFSET, self.hidden_volume_size);
        write_u64(&mut payload[..], DATA_SIZE_OFFSET, self.data_area_size);
        write_u64(&mut payload[..], DATA_START_OFFSET, self.data_area_offset);
        write_u64(&mut payload[..], ENCRYPTED_LEN_OFFSET, self.encrypted_area_length);
        write_u32(&mut payload[..], FLAGS_OFFSET, self.flags);
        write_u32(&mut payload[..], SECTOR_SIZE_OFFSET, self.sector_size);
        payload[KEY_AREA_OFFSET..].copy_from_slice(&self.master_keydata);

        let key_crc = crc32fast::hash(&payload[KEY_AREA_OFFSET..]);
        write_u32(&mut payload[..], KEY_CRC_OFFSET, key_crc);
        let header_crc = crc32fast::hash(&payload[..HEADER_CRC_OFFSET]);
        write_u32(&mut payload[..], HEADER_CRC_OFFSET, header_crc);
        payload
    }

    /// Runs the open flow against one on-disk header record: mix keyfiles,
    /// derive the header key, decrypt the payload as XTS unit 0 and
    /// validate.
    pub(crate) fn decrypt(
        record: &[u8; HEADER_LEN],
        password: &[u8],
        pim: u32,
        keyfiles: &[Keyfile],
    ) -> Result<Self, VolumeError> {
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&record[..SALT_LEN]);

        let mixed = keyfile::mix(password, keyfiles);
        let iterations = kdf::iterations(VolumeKind::Standard, pim);
        let header_key = kdf::derive_header_key(&mixed, &salt, iterations);
        let xts = Xts::new(&header_key[..])?;

        let mut payload = Zeroizing::new([0u8; PAYLOAD_LEN]);
        payload.copy_from_slice(&record[SALT_LEN..]);
        xts.decrypt_unit(&mut payload[..], 0);

        let header = Self::parse(&payload)?;
        debug!(
            "header authenticated after {iterations} iterations, format version {}",
            header.version
        );
        Ok(header)
    }

    /// Produces the on-disk record for this header under the given
    /// credentials and salt.
    pub(crate) fn encrypt(
        &self,
        password: &[u8],
        pim: u32,
        keyfiles: &[Keyfile],
        salt: &[u8; SALT_LEN],
    ) -> Result<[u8; HEADER_LEN], VolumeError> {
        let mixed = keyfile::mix(password, keyfiles);
        let iterations = kdf::iterations(VolumeKind::Standard, pim);
        let header_key = kdf::derive_header_key(&mixed, salt, iterations);
        let xts = Xts::new(&header_key[..])?;

        let mut payload = self.to_payload();
        xts.encrypt_unit(&mut payload[..], 0);

        let mut record = [0u8; HEADER_LEN];
        record[..SALT_LEN].copy_from_slice(salt);
        record[SALT_LEN..].copy_from_slice(&payload[..]);
        Ok(record)
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> VolumeHeader {
        let mut master_keydata = [0u8; KEY_AREA_LEN];
        for (i, b) in master_keydata.iter_mut().enumerate() {
            *b = (i * 13 + 5) as u8;
        }
        VolumeHeader {
            version: FORMAT_VERSION,
            min_program_version: MIN_PROGRAM_VERSION,
            volume_creation_time: 1_700_000_000,
            header_creation_time: 1_700_000_001,
            hidden_volume_size: 0,
            data_area_size: 10_223_616,
            data_area_offset: DATA_AREA_OFFSET,
            encrypted_area_length: 10_223_616,
            flags: 0,
            sector_size: 512,
            master_keydata,
        }
    }

    #[test]
    fn payload_round_trip() {
        let header = sample_header();
        let payload = header.to_payload();
        let parsed = VolumeHeader::parse(&payload).unwrap();
        assert_eq!(parsed.version, header.version);
        assert_eq!(parsed.data_area_size, header.data_area_size);
        assert_eq!(parsed.data_area_offset, DATA_AREA_OFFSET);
        assert_eq!(parsed.sector_size, 512);
        assert_eq!(parsed.master_keydata, header.master_keydata);
    }

    #[test]
    fn payload_fields_are_big_endian() {
        let payload = sample_header().to_payload();
        assert_eq!(&payload[..4], b"VERA");
        assert_eq!(u16::from_be_bytes([payload[4], payload[5]]), FORMAT_VERSION);
        assert_eq!(
            u32::from_be_bytes(payload[64..68].try_into().unwrap()),
            512
        );
    }

    #[test]
    fn record_round_trip() {
        let header = sample_header();
        let salt = [7u8; SALT_LEN];
        let keyfiles = [Keyfile::new(b"kf".to_vec())];
        let record = header.encrypt(b"testpassword", 1, &keyfiles, &salt).unwrap();
        let reopened = VolumeHeader::decrypt(&record, b"testpassword", 1, &keyfiles).unwrap();
        assert_eq!(reopened.data_area_size, header.data_area_size);
        assert_eq!(reopened.master_keydata, header.master_keydata);
    }

    #[test]
    fn wrong_password_is_auth_failure() {
        let record = sample_header()
            .encrypt(b"right", 1, &[], &[1u8; SALT_LEN])
            .unwrap();
        match VolumeHeader::decrypt(&record, b"wrong", 1, &[]) {
            Err(VolumeError::AuthFailed) => {}
            Err(other) => panic!("expected AuthFailed, got {other}"),
            Ok(_) => panic!("expected AuthFailed, got success"),
        }
    }

    #[test]
    fn tampered_record_is_auth_failure() {
        let mut record = sample_header()
            .encrypt(b"pw", 1, &[], &[2u8; SALT_LEN])
            .unwrap();
        record[HEADER_LEN - 1] ^= 0x40;
        match VolumeHeader::decrypt(&record, b"pw", 1, &[]) {
            Err(VolumeError::AuthFailed) => {}
            Err(other) => panic!("expected AuthFailed, got {other}"),
            Ok(_) => panic!("expected AuthFailed, got success"),
        }
    }
}
