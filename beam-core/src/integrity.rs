//! Integrity: whole-file SHA-256 for chunked transfers, and the table of
//! digests announced by senders for files still in flight.

use std::collections::HashMap;
use std::io::{self, Read};

use sha2::{Digest, Sha256};

const READ_BUF: usize = 64 * 1024;

/// Hex SHA-256 of a byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of everything `reader` yields.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Case-insensitive compare of two hex digests.
pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected)
}

/// Digests announced via `file_digest`, keyed by file name. Consumed when the
/// file completes.
#[derive(Debug, Default)]
pub struct ExpectedDigests {
    by_name: HashMap<String, String>,
}

impl ExpectedDigests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the digest for `name`; a later announcement replaces it.
    pub fn insert(&mut self, name: impl Into<String>, sha256: impl Into<String>) {
        self.by_name.insert(name.into(), sha256.into());
    }

    /// Take the digest for a completed file, if one was announced.
    pub fn take(&mut self, name: &str) -> Option<String> {
        self.by_name.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}
