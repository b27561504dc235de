use std::io;

use thiserror::Error;

/// Errors surfaced by the volume store, frame codec, FEC codec and the two
/// pipeline threads.
///
/// Mirrors the one-`thiserror`-enum-per-concern style used elsewhere for
/// on-disk format errors: named variants, `#[from] io::Error`, no stringly
/// typed error paths.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("no space left on device ({free_bytes} bytes free)")]
    NoSpace { free_bytes: u64 },

    #[error("format error: {0}")]
    Format(String),

    #[error("checksum error: {0}")]
    Checksum(String),

    #[error("minimum reader version {required:#x} exceeds implementation version {implemented:#x}")]
    VersionMismatch { required: u64, implemented: u64 },

    #[error("volume mismatch: {0}")]
    VolumeMismatch(String),

    #[error("fec block unrecoverable: needed {needed} good packets, found {found}")]
    Unrecoverable { needed: usize, found: usize },

    #[error("end of archive")]
    EndOfArchive,
}

impl ArchiveError {
    pub fn format<S: Into<String>>(msg: S) -> Self {
        ArchiveError::Format(msg.into())
    }

    pub fn checksum<S: Into<String>>(msg: S) -> Self {
        ArchiveError::Checksum(msg.into())
    }

    pub fn volume_mismatch<S: Into<String>>(msg: S) -> Self {
        ArchiveError::VolumeMismatch(msg.into())
    }

    /// `true` for the clean end-of-stream terminator, as opposed to any
    /// genuine failure.
    pub fn is_end_of_archive(&self) -> bool {
        matches!(self, ArchiveError::EndOfArchive)
    }
}
