use sha2::{Digest, Sha256};

/// Hex digest (32 chars) used for content-addressed file names, guard
/// variables and notice ids. Stable across runs and platforms.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash("var a = 1;");
        assert_eq!(a.len(), 32);
        assert_eq!(a, content_hash("var a = 1;"));
        assert_ne!(a, content_hash("var a = 2;"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
