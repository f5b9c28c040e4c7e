//! Integrity Verification
//!
//! SHA-256 digests for chunks and assembled objects. Digests travel as
//! lowercase hex.

use sha2::{Digest, Sha256};

use super::types::UploadError;

/// Compute the SHA-256 hex digest of data
pub fn compute_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Normalize a caller-supplied digest to lowercase hex
pub fn normalize_hash(hash: &str) -> Result<String, UploadError> {
    let hash = hash.trim().to_ascii_lowercase();
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(UploadError::Validation(format!(
            "invalid SHA-256 digest: {:?}",
            hash
        )));
    }
    Ok(hash)
}

/// Hash `data` and compare it with an optional declared digest.
///
/// Returns the computed digest.
pub fn verify(data: &[u8], declared: Option<&str>) -> Result<String, UploadError> {
    let actual = compute_hash(data);

    if let Some(declared) = declared {
        let expected = normalize_hash(declared)?;
        if expected != actual {
            return Err(UploadError::ChunkHashMismatch { expected, actual });
        }
    }

    Ok(actual)
}

/// Incremental hasher for an object assembled from chunks
#[derive(Default)]
pub struct ObjectHasher {
    hasher: Sha256,
    size: u64,
}

impl ObjectHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finish hashing. Returns the hex digest and total size.
    pub fn finalize(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_compute_hash() {
        assert_eq!(compute_hash(b"abc"), ABC);
        assert!(compute_hash(b"").starts_with("e3b0c442"));
    }

    #[test]
    fn test_verify_accepts_uppercase_digest() {
        let digest = verify(b"abc", Some(&ABC.to_uppercase())).unwrap();
        assert_eq!(digest, ABC);
        assert_eq!(verify(b"abc", None).unwrap(), ABC);
    }

    #[test]
    fn test_verify_mismatch() {
        let wrong = "0".repeat(64);
        match verify(b"abc", Some(&wrong)) {
            Err(UploadError::ChunkHashMismatch { expected, actual }) => {
                assert_eq!(expected, wrong);
                assert_eq!(actual, ABC);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_digest_is_validation_error() {
        assert!(matches!(
            verify(b"abc", Some("not-a-digest")),
            Err(UploadError::Validation(_))
        ));
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = ObjectHasher::new();
        hasher.update(b"a");
        hasher.update(b"bc");
        assert_eq!(hasher.finalize(), (ABC.to_string(), 3));
    }
}
