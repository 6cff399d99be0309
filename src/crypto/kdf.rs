use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use zeroize::Zeroizing;

/// Length of the salt stored in front of the header payload.
pub const SALT_LEN: usize = 64;
/// Length of the derived header key: two AES-256 halves for XTS.
pub const HEADER_KEY_LEN: usize = 64;

/// The kind of volume a key is derived for; each kind carries its own
/// iteration schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VolumeKind {
    /// A regular file-hosted or partition-hosted volume.
    Standard,
    /// A system-encryption volume. Retained for schedule compatibility;
    /// such volumes cannot be mounted by this crate.
    System,
}

/// PBKDF2 iteration count for the given kind and PIM. A PIM of `0` selects
/// the default count.
pub fn iterations(kind: VolumeKind, pim: u32) -> u32 {
    match (kind, pim) {
        (VolumeKind::Standard, 0) => 500_000,
        (VolumeKind::Standard, pim) => 15_000u32.saturating_add(pim.saturating_mul(1_000)),
        (VolumeKind::System, 0) => 200_000,
        (VolumeKind::System, pim) => pim.saturating_mul(2_048),
    }
}

/// Derives the 64-byte header key from a (possibly keyfile-mixed) password
/// and the header salt.
pub fn derive_header_key(
    password: &[u8],
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Zeroizing<[u8; HEADER_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; HEADER_KEY_LEN]);
    pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut key[..]);
    key
}
