use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("can't read recording: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a recording file (magic {0:02x?})")]
    BadMagic([u8; 4]),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),
    #[error("truncated record")]
    Truncated,
}
