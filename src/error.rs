use std::io;

/// Errors surfaced by volume and filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// Header authentication failed. Deliberately does not distinguish a
    /// wrong password from a damaged header.
    #[error("invalid password or corrupted volume header")]
    AuthFailed,
    #[error("corrupted volume: {0}")]
    Corrupt(&'static str),
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("no free clusters left on the volume")]
    DiskFull,
    #[error("request crosses the device boundary: offset {offset:#x}, length {len}")]
    OutOfBounds { offset: u64, len: u64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
