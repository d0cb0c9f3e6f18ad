//! Content hashing utilities
//!
//! Blobs are addressed by the lowercase hex sha256 of their bytes.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Result, SyncError};

/// Read buffer for streaming hashes
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Hex-encoded sha256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Stream a file through sha256, returning (hex digest, bytes read)
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path).map_err(|e| SyncError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buffer).map_err(|e| SyncError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}
