use std::collections::TryReserveError;
use std::io;

/// Errors produced while decoding bytecode or a saved state stream.
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("decoded value overflows {0}")]
    Overflow(&'static str),

    #[error("bad signature: expected {expected:?}, found {found:?}")]
    BadSignature { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported format version {0}")]
    Version(u32),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(io::Error),
}

impl ReadError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        ReadError::Malformed(msg.into())
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => ReadError::UnexpectedEof,
            _ => ReadError::Io(e),
        }
    }
}

/// Errors surfaced at the host-facing API boundary.
///
/// Script faults are never reported here; they kill the offending thread and
/// go through [`crate::EnvHooks::kill`] instead.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("allocation failed: {0}")]
    Alloc(#[from] TryReserveError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("environment is busy executing scripts")]
    Busy,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_maps_to_unexpected_eof() {
        let e: ReadError = io::Error::new(io::ErrorKind::UnexpectedEof, "short").into();
        assert!(matches!(e, ReadError::UnexpectedEof));

        let e: ReadError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(e, ReadError::Io(_)));
    }

    #[test]
    fn read_error_converts_to_error() {
        let e: Error = ReadError::Version(7).into();
        assert_eq!(e.to_string(), "unsupported format version 7");
    }
}
