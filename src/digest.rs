//! Content hashing.
//!
//! All idempotency decisions compare SHA-256 digests of raw bytes. No
//! normalization is applied: a byte-order mark or a CRLF line ending is part
//! of the content.

use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::Path;

use crate::error::Result;

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn content_hash(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Hash of the file at `path`, or `None` when it does not exist.
pub fn file_hash(path: &Path) -> Result<Option<String>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(content_hash(bytes))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
