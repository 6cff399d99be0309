use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit, consts::U16};
use aes::{Aes128, Aes256, Block};

use crate::error::VolumeError;

/// Size of one encrypted sector in bytes.
pub const SECTOR_SIZE: usize = 512;
const BLOCK_SIZE: usize = 16;

#[derive(Copy, Clone)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// AES-XTS cipher bound to one master key.
///
/// The key is split in half: the first half keys the data cipher, the second
/// half the tweak cipher. A 32-byte key selects AES-128, a 64-byte key
/// AES-256. The cipher is stateless per call and safe to share across
/// threads.
pub struct Xts {
    inner: Inner,
}

enum Inner {
    Aes128(Keys<Aes128>),
    Aes256(Keys<Aes256>),
}

struct Keys<C> {
    data: C,
    tweak: C,
}

impl Xts {
    pub fn new(key: &[u8]) -> Result<Self, VolumeError> {
        let inner = match key.len() {
            32 => Inner::Aes128(Keys {
                data: Aes128::new(GenericArray::from_slice(&key[..16])),
                tweak: Aes128::new(GenericArray::from_slice(&key[16..])),
            }),
            64 => Inner::Aes256(Keys {
                data: Aes256::new(GenericArray::from_slice(&key[..32])),
                tweak: Aes256::new(GenericArray::from_slice(&key[32..])),
            }),
            _ => {
                return Err(VolumeError::InvalidArgument(
                    "XTS key length must be 32 or 64 bytes",
                ));
            }
        };
        Ok(Self { inner })
    }

    /// Encrypts one XTS data unit in place. The unit may be any multiple of
    /// 16 bytes; the tweak advances across all of its blocks.
    pub fn encrypt_unit(&self, buf: &mut [u8], unit: u64) {
        match &self.inner {
            Inner::Aes128(keys) => keys.crypt_unit(buf, unit, Direction::Encrypt),
            Inner::Aes256(keys) => keys.crypt_unit(buf, unit, Direction::Encrypt),
        }
    }

    /// Decrypts one XTS data unit in place.
    pub fn decrypt_unit(&self, buf: &mut [u8], unit: u64) {
        match &self.inner {
            Inner::Aes128(keys) => keys.crypt_unit(buf, unit, Direction::Decrypt),
            Inner::Aes256(keys) => keys.crypt_unit(buf, unit, Direction::Decrypt),
        }
    }

    /// Encrypts a run of consecutive 512-byte sectors in place, each sector
    /// being its own data unit numbered upwards from `first_sector`.
    pub fn encrypt_sectors(&self, buf: &mut [u8], first_sector: u64) {
        match &self.inner {
            Inner::Aes128(keys) => keys.crypt_sectors(buf, first_sector, Direction::Encrypt),
            Inner::Aes256(keys) => keys.crypt_sectors(buf, first_sector, Direction::Encrypt),
        }
    }

    /// Decrypts a run of consecutive 512-byte sectors in place.
    pub fn decrypt_sectors(&self, buf: &mut [u8], first_sector: u64) {
        match &self.inner {
            Inner::Aes128(keys) => keys.crypt_sectors(buf, first_sector, Direction::Decrypt),
            Inner::Aes256(keys) => keys.crypt_sectors(buf, first_sector, Direction::Decrypt),
        }
    }
}

impl<C> Keys<C>
where
    C: BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16>,
{
    /// Initial tweak for a data unit: the unit number as a little-endian
    /// 16-byte block, encrypted under the tweak key.
    fn tweak0(&self, unit: u64) -> [u8; BLOCK_SIZE] {
        let mut block = Block::default();
        block[..8].copy_from_slice(&unit.to_le_bytes());
        self.tweak.encrypt_block(&mut block);
        let mut out = [0u8; BLOCK_SIZE];
        out.copy_from_slice(&block);
        out
    }

    fn crypt_unit(&self, buf: &mut [u8], unit: u64, direction: Direction) {
        assert_eq!(
            buf.len() % BLOCK_SIZE,
            0,
            "XTS unit length must be a multiple of 16"
        );

        let mut tweak = self.tweak0(unit);
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            xor_in_place(chunk, &tweak);
            let block = Block::from_mut_slice(chunk);
            match direction {
                Direction::Encrypt => self.data.encrypt_block(block),
                Direction::Decrypt => self.data.decrypt_block(block),
            }
            xor_in_place(chunk, &tweak);
            gf_mul_alpha(&mut tweak);
        }
    }

    /// Hot path: the whole tweak schedule is materialised up front, the
    /// buffer whitened in one sweep, and the block cipher driven over the
    /// full batch in a single bulk call.
    fn crypt_sectors(&self, buf: &mut [u8], first_sector: u64, direction: Direction) {
        assert_eq!(
            buf.len() % SECTOR_SIZE,
            0,
            "sector batch length must be a multiple of 512"
        );

        let mut schedule = vec![0u8; buf.len()];
        for (index, sector) in schedule.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let mut tweak = self.tweak0(first_sector + index as u64);
            for slot in sector.chunks_exact_mut(BLOCK_SIZE) {
                slot.copy_from_slice(&tweak);
                gf_mul_alpha(&mut tweak);
            }
        }

        xor_in_place(buf, &schedule);
        // SAFETY: `Block` is a 16-byte array of `u8` with alignment 1, and
        // the batch length is a multiple of the block size.
        let blocks: &mut [Block] = unsafe {
            core::slice::from_raw_parts_mut(buf.as_mut_ptr().cast(), buf.len() / BLOCK_SIZE)
        };
        match direction {
            Direction::Encrypt => self.data.encrypt_blocks(blocks),
            Direction::Decrypt => self.data.decrypt_blocks(blocks),
        }
        xor_in_place(buf, &schedule);
    }
}

/// Multiplies a tweak by α in GF(2^128) with the irreducible polynomial
/// x^128 + x^7 + x^2 + x + 1, treating the tweak as two little-endian
/// 64-bit words.
fn gf_mul_alpha(tweak: &mut [u8; BLOCK_SIZE]) {
    let lo = u64::from_le_bytes(tweak[..8].try_into().unwrap());
    let hi = u64::from_le_bytes(tweak[8..].try_into().unwrap());
    let carry = if hi >> 63 != 0 { 0x87 } else { 0 };
    tweak[..8].copy_from_slice(&((lo << 1) ^ carry).to_le_bytes());
    tweak[8..].copy_from_slice(&((hi << 1) | (lo >> 63)).to_le_bytes());
}

fn xor_in_place(buf: &mut [u8], mask: &[u8]) {
    for (b, m) in buf.iter_mut().zip(mask) {
        *b ^= m;
    }
}
