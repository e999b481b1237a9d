use std::io;

/// Error taxonomy for store operations.
///
/// Every fallible operation returns one of these variants instead of an
/// integer code; the `Display` text doubles as the human-readable
/// description a caller would otherwise look up via a `strerror`-style
/// function.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("generic error")]
    Generic,

    #[error("invalid argument")]
    InvalidArg,

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("failed to open data file")]
    OpenData(#[source] io::Error),

    #[error("failed to read data file")]
    ReadData(#[source] io::Error),

    #[error("failed to write data file")]
    WriteData(#[source] io::Error),

    #[error("failed to open index file")]
    OpenIndex(#[source] io::Error),

    #[error("failed to read index file")]
    ReadIndex(#[source] io::Error),

    #[error("failed to write index file")]
    WriteIndex(#[source] io::Error),

    #[error("bad data file format")]
    BadDataFormat,

    #[error("bad index file format")]
    BadIndexFormat,

    #[error("entry seqnum does not match expected next value")]
    BadEntrySeqnum,

    #[error("entry timestamp is older than the previous entry")]
    BadEntryTimestamp,

    #[error("entry metadata is missing or malformed")]
    MissingEntryMetadata,

    #[error("entry data is missing or malformed")]
    MissingEntryData,

    #[error("seqnum or timestamp not found")]
    NotFound,

    #[error("temporary file operation failed")]
    TempFile(#[source] io::Error),

    #[error("record checksum mismatch")]
    ChecksumMismatch,
}

impl StoreError {
    /// Human-readable description, mirroring what a C API would expose as
    /// `strerror(errnum)`.
    #[must_use]
    pub fn strerror(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
