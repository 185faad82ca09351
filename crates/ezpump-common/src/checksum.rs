//! Content hashing for assets
//!
//! Two different digests are in play:
//!
//! - [`content_id`] / [`content_id_of`] produce the SHA-256 based `unique_id`
//!   used as the key of the intermediate `filestore` table when the caller does
//!   not supply one.
//! - [`fingerprint`] / [`fingerprint_file`] reproduce the asset server's own
//!   `unique_id`: SHA-1 over the first 4 KiB, then SHA-1 over
//!   `"<hex digest>/<total size>"`. Searching the asset server by this value
//!   finds byte-identical uploads.

use crate::error::Result;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Number of leading bytes covered by the asset fingerprint.
pub const FINGERPRINT_PREFIX_LEN: usize = 4096;

const READ_BUFFER_LEN: usize = 8192;

/// SHA-256 hex digest of any readable source
pub fn content_id<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER_LEN];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 hex digest of an in-memory blob
pub fn content_id_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Asset server fingerprint of an in-memory blob
pub fn fingerprint(data: &[u8]) -> String {
    let prefix = &data[..data.len().min(FINGERPRINT_PREFIX_LEN)];
    combine(prefix, data.len() as u64)
}

/// Asset server fingerprint of a file, reading only its first 4 KiB
pub fn fingerprint_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let total_len = std::fs::metadata(path)?.len();

    let mut prefix = Vec::with_capacity(FINGERPRINT_PREFIX_LEN);
    std::fs::File::open(path)?
        .take(FINGERPRINT_PREFIX_LEN as u64)
        .read_to_end(&mut prefix)?;

    Ok(combine(&prefix, total_len))
}

fn combine(prefix: &[u8], total_len: u64) -> String {
    let prefix_digest = hex::encode(Sha1::digest(prefix));
    hex::encode(Sha1::digest(format!("{}/{}", prefix_digest, total_len).as_bytes()))
}
