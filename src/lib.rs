//! # verafs
//!
//! A VeraCrypt-compatible encrypted block-container engine with a FAT32
//! filesystem inside.
//!
//! A container is a single file (or any [`BlockDevice`]): a password-derived
//! header holds the master key, the data area is encrypted sector-by-sector
//! with AES-XTS, and the plaintext sectors carry an ordinary FAT32
//! filesystem with long-filename support.
//!
//! ## Usage
//!
//! ```rust
//! use verafs::{CreateVolumeOptionsBuilder, MemDevice, Volume};
//!
//! let size = 2 * 1024 * 1024;
//! let options = CreateVolumeOptionsBuilder::default()
//!     .total_size(size as u64)
//!     .password(b"correct horse".to_vec())
//!     .pim(1)
//!     .build()
//!     .unwrap();
//!
//! let volume = Volume::create(MemDevice::new(size), &options).unwrap();
//! volume.create_directory("/", "notes").unwrap();
//! volume.write("/notes/today.txt", b"attack at dawn").unwrap();
//! assert_eq!(volume.read("/notes/today.txt").unwrap(), b"attack at dawn");
//! volume.close();
//! ```

mod cache;
/// Key derivation, keyfile mixing and the XTS sector codec.
pub mod crypto;
/// Block-device abstraction over positioned byte I/O.
pub mod device;
mod error;
mod fat;
/// Container creation.
pub mod format;
/// The 512-byte volume header codec.
pub mod header;
mod sector;
mod volume;

pub use crypto::kdf::VolumeKind;
pub use crypto::keyfile::Keyfile;
pub use crypto::xts::SECTOR_SIZE;
pub use device::{BlockDevice, MemDevice};
pub use error::VolumeError;
pub use fat::FileEntry;
pub use format::{CreateVolumeOptions, CreateVolumeOptionsBuilder, MIN_VOLUME_SIZE, create_volume};
pub use header::{DATA_AREA_OFFSET, HeaderFlags, VolumeHeader};
pub use volume::Volume;
