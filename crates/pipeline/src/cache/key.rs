//! Content-derived cache keys.

use sha2::{Digest, Sha256};

pub const KEY_PREFIX: &str = "pptx";

/// Key for an archive digest processed under the options summarised by
/// `fingerprint`. Same bytes and same options always give the same key.
pub fn derive_key(archive_digest: &str, fingerprint: &str) -> String {
    let options = hex::encode(Sha256::digest(fingerprint.as_bytes()));
    format!("{}:{}:{}", KEY_PREFIX, archive_digest, &options[..16])
}

/// Tag attached to every entry derived from one archive.
pub fn archive_tag(archive_digest: &str) -> String {
    format!("archive:{}", archive_digest)
}
