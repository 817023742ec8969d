//! Content fingerprints used for change detection.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of `text` after line-ending normalisation.
///
/// CRLF is folded to LF and trailing whitespace at the very end is ignored,
/// so an editor adding or dropping the final newline is not a change.
pub fn fingerprint(text: &str) -> String {
    let normalized = normalize(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// `true` when both texts carry the same fingerprint.
pub fn same_content(a: &str, b: &str) -> bool {
    fingerprint(a) == fingerprint(b)
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").trim_end().to_string()
}
