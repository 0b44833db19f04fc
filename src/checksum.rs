use crate::error::FgError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

pub fn sha256_file(path: &Path) -> Result<String, FgError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compares the digest of `path` against `expected` (hex, any case).
pub fn verify_checksum(path: &Path, expected: &str) -> Result<(), FgError> {
    let expected = expected.trim().to_ascii_lowercase();
    let actual = sha256_file(path)?;
    if expected != actual {
        return Err(FgError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}
