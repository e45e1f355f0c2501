//! Streaming SHA-256 for fetched files.
//!
//! Fetched bytes are hashed as they are written, so verification needs no
//! second read of the staged file. [`compute_sha256`] re-hashes a file on disk.

use crate::error::{Result, SyncError};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Chunk size for reading files from disk.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Incremental SHA-256 that also counts bytes.
#[derive(Debug, Clone, Default)]
pub struct StreamingHash {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compute the SHA-256 of a file as lowercase hex.
pub fn compute_sha256(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| SyncError::io_with_path(e, path))?;

    let mut hash = StreamingHash::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| SyncError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hash.update(&buffer[..bytes_read]);
    }
    Ok(hash.finish())
}

/// Compare two hex digests ignoring case.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_streaming_hash_chunked() {
        let mut hash = StreamingHash::new();
        hash.update(b"he");
        hash.update(b"llo");
        assert_eq!(hash.bytes(), 5);
        assert_eq!(hash.finish(), HELLO_SHA256);
    }

    #[test]
    fn test_compute_sha256_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        file.flush().unwrap();
        assert_eq!(compute_sha256(file.path()).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_compute_sha256_missing_file() {
        let err = compute_sha256("/nonexistent/file").unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }

    #[test]
    fn test_digests_match_case_insensitive() {
        assert!(digests_match(&HELLO_SHA256.to_uppercase(), HELLO_SHA256));
        assert!(!digests_match("00", HELLO_SHA256));
    }
}
