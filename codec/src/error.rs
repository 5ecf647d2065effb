//! Error types for codec operations

use thiserror::Error;

/// Error type for codec operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("extra data found: {0} bytes")]
    ExtraData(usize),
    #[error("invalid data in {0}: {1}")]
    InvalidData(String, String), // context, message
    #[error("length exceeded: {0} > {1}")]
    LengthExceeded(usize, usize), // found, max
    #[error("nesting depth exceeded: {0}")]
    DepthExceeded(usize),
    #[error("invalid varint")]
    InvalidVarint,
    #[error("invalid record tag: {0}")]
    InvalidTag(u8),
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    #[error("bad stream magic")]
    BadMagic,
    #[error("unsupported stream version: {0}")]
    UnsupportedStreamVersion(u8),
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("invalid field {field}: expected {expected}, found {found}")]
    InvalidField {
        field: String,
        expected: &'static str,
        found: String,
    },
    #[error("unencodable: {0}")]
    Unencodable(String),
}
