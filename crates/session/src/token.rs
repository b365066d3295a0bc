//! Runner tokens.
//!
//! The store only ever sees a SHA-256 hash; the plaintext is handed to
//! the sandbox at mint time and presented once on the runner upgrade.
//! Rotation replaces the stored hash, which atomically invalidates every
//! previously minted token.

use sha2::{Digest, Sha256};

/// A freshly minted runner token: plaintext for the sandbox, hash for
/// the store.
#[derive(Debug, Clone)]
pub struct RunnerToken {
    pub plaintext: String,
    pub hash: String,
}

impl RunnerToken {
    pub fn mint() -> Self {
        let bytes: [u8; 32] = rand::random();
        let plaintext = hex::encode(bytes);
        let hash = hash_token(&plaintext);
        RunnerToken { plaintext, hash }
    }
}

pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Check a presented token against the stored hash. Comparison happens
/// on digests, so timing reveals nothing about the plaintext.
pub fn verify_token(presented: &str, stored_hash: Option<&str>) -> bool {
    match stored_hash {
        Some(stored) => hash_token(presented) == stored,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_token_verifies_against_its_hash() {
        let token = RunnerToken::mint();
        assert_eq!(token.plaintext.len(), 64);
        assert!(verify_token(&token.plaintext, Some(&token.hash)));
    }

    #[test]
    fn rotation_invalidates_the_old_plaintext() {
        let old = RunnerToken::mint();
        let new = RunnerToken::mint();
        assert!(!verify_token(&old.plaintext, Some(&new.hash)));
        assert!(verify_token(&new.plaintext, Some(&new.hash)));
    }

    #[test]
    fn missing_hash_rejects_everything() {
        assert!(!verify_token("anything", None));
    }
}
