use std::io;

use thiserror::Error;

use crate::entry::Handle;

pub type Result<T> = std::result::Result<T, TevdError>;

#[derive(Error, Debug)]
pub enum TevdError {
    #[error("malformed input: {0}")]
    Malformed(&'static str),
    #[error("invalid magic number")]
    BadMagic,
    #[error("archive checksum mismatch")]
    ArchiveCorrupt,
    #[error("checksum mismatch in entry {0}")]
    EntryCorrupt(Handle),
    #[error("unknown entry kind: {0:#04x}")]
    UnknownEntryKind(u8),
    #[error("directory is full")]
    DirectoryFull,
    #[error("payload exceeds 48-bit size limit")]
    PayloadTooLarge,
    #[error("path already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

impl TevdError {
    /// A short read while parsing means the byte stream itself is bad, not
    /// the underlying device.
    pub(crate) fn from_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TevdError::Malformed("unexpected end of input")
        } else {
            TevdError::Io(e)
        }
    }
}
