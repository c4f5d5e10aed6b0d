use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The three files involved in one patch application. Owned by the caller
/// for the duration of the apply.
#[derive(Debug, Clone)]
pub struct PatchCommand {
    pub input_file: PathBuf,
    pub patch_file: PathBuf,
    pub output_file: PathBuf,
}

/// Recognized patch container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Ips,
    Bps,
}

/// Outcome of decoding one hunk or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A hunk was decoded and written; more may follow.
    Next,
    /// The patch stream is exhausted.
    Done,
}

/// Where the hunk loop stood at the time of the last progress publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterStatus {
    /// No hunk has been decoded yet.
    #[default]
    None,
    Next,
    Done,
    IoError,
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("I/O error: {0}")]
    Io(io::Error),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("varint exceeds 64 bits")]
    VarintOverflow,
    #[error("not an IPS or BPS patch")]
    UnknownType,
    #[error("failed to start decoder")]
    FailedToStart(#[source] Box<PatchError>),
    #[error("{what} copy out of range")]
    CopyOutOfRange { what: &'static str },
    #[error("output size mismatch: expected {expected} bytes, wrote {actual}")]
    InvalidOutputSize { expected: u64, actual: u64 },
    #[error("{what} checksum mismatch: expected {expected:08x}, computed {actual:08x}")]
    InvalidOutputChecksum {
        what: &'static str,
        expected: u32,
        actual: u32,
    },
}

impl From<io::Error> for PatchError {
    fn from(err: io::Error) -> Self {
        // Truncation is its own failure class, distinct from OS-level errors.
        if err.kind() == io::ErrorKind::UnexpectedEof {
            PatchError::UnexpectedEof
        } else {
            PatchError::Io(err)
        }
    }
}

/// Error classes surfaced over the progress channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchErrorKind {
    Io,
    UnknownType,
    FailedToStart,
    InvalidOutputSize,
    InvalidOutputChecksum,
}

impl PatchError {
    pub fn kind(&self) -> PatchErrorKind {
        match self {
            PatchError::Io(_)
            | PatchError::UnexpectedEof
            | PatchError::VarintOverflow
            | PatchError::CopyOutOfRange { .. } => PatchErrorKind::Io,
            PatchError::UnknownType => PatchErrorKind::UnknownType,
            PatchError::FailedToStart(_) => PatchErrorKind::FailedToStart,
            PatchError::InvalidOutputSize { .. } => PatchErrorKind::InvalidOutputSize,
            PatchError::InvalidOutputChecksum { .. } => PatchErrorKind::InvalidOutputChecksum,
        }
    }
}

/// Progress record shared between the patch worker and an observer.
///
/// The worker keeps a local copy and overwrites the shared one under its
/// lock at hunk boundaries; once `is_done` is set, no further mutations
/// occur.
#[derive(Debug, Clone, Default)]
pub struct PatchStatus {
    pub hunk_count: u64,
    pub iter_status: IterStatus,
    pub err: Option<PatchErrorKind>,
    pub is_done: bool,
}
