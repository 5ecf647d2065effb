//! Persist search indexes larger than memory as content-addressed skeleton B-trees.
//!
//! # Overview
//!
//! An index is held in a [skeleton::SkeletonBTreeMap]: an ordinary B-tree whose nodes may be
//! swapped out to a content-addressed store. A swapped-out node is a _ghost_ (only its
//! [address::Address] is known); a resident node is _bare_. Callers `inflate` the paths they need,
//! mutate them with batched `update`s, and `deflate` to persist everything that changed.
//!
//! Node I/O goes through the [serial] archiver tiers (single, iterable, live, scheduled). Scheduled
//! work runs on a [scheduler::ObjectProcessor]. The [index] module builds the top-level
//! [index::ProtoIndex] (a term table and a URI table) and its composite serializer.
//!
//! # Status
//!
//! `freelib-storage` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

pub mod address;
pub mod index;
pub mod scheduler;
pub mod serial;
pub mod skeleton;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors crossing the archiver, scheduler, and tree boundaries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("aborted: {message}")]
    Abort {
        message: String,
        retryable: bool,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("data format error: {0}")]
    Format(#[from] freelib_codec::Error),
    #[error("malformed address: {0}")]
    MalformedAddress(String),
    #[error("unrecognised serial format: {0:#x}")]
    UnsupportedFormat(i64),
    #[error("data structure is not bare; try calling deflate() first")]
    NotBare,
    #[error("processor closed")]
    Closed,
    #[error("thread pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    /// Creates an [Error::Abort] without an underlying cause.
    pub fn abort(message: impl Into<String>, retryable: bool) -> Self {
        Error::Abort {
            message: message.into(),
            retryable,
            cause: None,
        }
    }

    /// Creates an [Error::Abort] wrapping `cause`.
    pub fn abort_with(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
        retryable: bool,
    ) -> Self {
        Error::Abort {
            message: message.into(),
            retryable,
            cause: Some(Box::new(cause)),
        }
    }

    /// Whether repeating the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Abort {
                retryable: true,
                ..
            }
        )
    }
}

/// Converts bytes to a lowercase hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Converts a hexadecimal string to bytes.
pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Hashes `bytes` with SHA-256.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let bytes = [0x00, 0x7f, 0xab, 0xff];
        assert_eq!(hex(&bytes), "007fabff");
        assert_eq!(from_hex("007fabff").unwrap(), bytes);
        assert!(from_hex("abc").is_none());
        assert!(from_hex("zz").is_none());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::abort("timeout", true).is_retryable());
        assert!(!Error::abort("gone", false).is_retryable());
        assert!(!Error::NotBare.is_retryable());
    }
}
