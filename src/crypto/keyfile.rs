use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use zeroize::Zeroizing;

/// Only the first MiB of a keyfile takes part in the pool.
pub const MAX_KEYFILE_BYTES: usize = 1024 * 1024;

const SMALL_POOL: usize = 64;
const LARGE_POOL: usize = 128;

/// The contents of one keyfile. The bytes are wiped on drop.
#[derive(Clone)]
pub struct Keyfile(Zeroizing<Vec<u8>>);

impl Keyfile {
    /// Wraps raw keyfile bytes, truncated to the significant 1 MiB.
    pub fn new(mut bytes: Vec<u8>) -> Self {
        bytes.truncate(MAX_KEYFILE_BYTES);
        Self(Zeroizing::new(bytes))
    }

    /// Reads a keyfile from disk, capped at 1 MiB.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?
            .take(MAX_KEYFILE_BYTES as u64)
            .read_to_end(&mut bytes)?;
        Ok(Self(Zeroizing::new(bytes)))
    }
}

/// Folds the keyfiles into the password.
///
/// Every keyfile feeds a rolling CRC32 register (initialised to
/// `0xFFFFFFFF`, never finalised); after each input byte the register's four
/// bytes, most significant first, are added mod 256 into the pool at a
/// wrapping cursor. The pool holds 64 bytes, or 128 when the password is
/// longer than 64 bytes. The result is the byte-wise mod-256 sum of password
/// and pool over `max(password_len, pool_len)` positions. An empty keyfile
/// list returns the password unchanged.
pub fn mix(password: &[u8], keyfiles: &[Keyfile]) -> Zeroizing<Vec<u8>> {
    if keyfiles.is_empty() {
        return Zeroizing::new(password.to_vec());
    }

    let pool_len = if password.len() <= SMALL_POOL {
        SMALL_POOL
    } else {
        LARGE_POOL
    };
    let mut pool = Zeroizing::new(vec![0u8; pool_len]);

    for keyfile in keyfiles {
        let mut crc = crc32fast::Hasher::new();
        let mut cursor = 0usize;
        for byte in keyfile.0.iter() {
            crc.update(std::slice::from_ref(byte));
            // The pool consumes the raw register, which is the complement of
            // the finalised CRC value.
            let register = !crc.clone().finalize();
            for shift in [24u32, 16, 8, 0] {
                pool[cursor] = pool[cursor].wrapping_add((register >> shift) as u8);
                cursor = (cursor + 1) % pool_len;
            }
        }
    }

    let out_len = password.len().max(pool_len);
    let mut out = Zeroizing::new(vec![0u8; out_len]);
    for (i, slot) in out.iter_mut().enumerate() {
        let p = password.get(i).copied().unwrap_or(0);
        let k = pool.get(i).copied().unwrap_or(0);
        *slot = p.wrapping_add(k);
    }
    out
}
