/*
 * Provides stable SHA-256 based keys for the durable blob store. A workspace
 * root (or a whole root set) is reduced to a short hex digest so that it can be
 * used as a file-name-safe key that survives across sessions.
 */
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

// Number of hex characters kept from the digest; 64 bits is plenty for a key.
const KEY_DIGEST_LEN: usize = 16;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/*
 * Key under which the token cache of a single workspace root is persisted.
 */
pub fn token_cache_key_for_root(root: &Path) -> String {
    let digest = sha256_hex(root.to_string_lossy().as_bytes());
    format!("tokens-{}", &digest[..KEY_DIGEST_LEN])
}

/*
 * Key under which the checked-paths list of a session is persisted. The roots
 * are sorted first so that the key does not depend on declaration order.
 */
pub fn selection_key_for_roots(roots: &[PathBuf]) -> String {
    let mut sorted: Vec<String> = roots
        .iter()
        .map(|r| r.to_string_lossy().into_owned())
        .collect();
    sorted.sort();
    let digest = sha256_hex(sorted.join("\n").as_bytes());
    format!("selection-{}", &digest[..KEY_DIGEST_LEN])
}
