//! Secret generation and salted hashing for runner credentials, lease
//! tokens and registration tokens.
//!
//! Only hashes are persisted. The plaintext secret is returned to the
//! caller exactly once.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// A freshly minted secret plus what the store keeps of it.
#[derive(Debug, Clone)]
pub struct SaltedToken {
    pub token: String,
    pub salt: String,
    pub hash: String,
    pub last_eight: String,
}

impl SaltedToken {
    pub fn generate() -> Self {
        let token = random_hex(20);
        let salt = random_hex(10);
        let hash = hash_token(&token, &salt);
        let last_eight = last_eight(&token);
        Self {
            token,
            salt,
            hash,
            last_eight,
        }
    }
}

pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn hash_token(token: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Unsalted digest, used where the secret itself is the lookup key.
pub fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Compare a presented token against a stored salted hash.
pub fn verify(token: &str, salt: &str, hash: &str) -> bool {
    let computed = hash_token(token, salt);
    constant_time_eq(computed.as_bytes(), hash.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn last_eight(token: &str) -> String {
    let start = token.len().saturating_sub(8);
    token[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_verify() {
        let t = SaltedToken::generate();
        assert_eq!(t.token.len(), 40);
        assert_eq!(t.last_eight, &t.token[32..]);
        assert!(verify(&t.token, &t.salt, &t.hash));
        assert!(!verify("not-the-token", &t.salt, &t.hash));
    }

    #[test]
    fn tokens_are_unique() {
        let a = SaltedToken::generate();
        let b = SaltedToken::generate();
        assert_ne!(a.token, b.token);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(digest("abc"), digest("abc"));
        assert_ne!(digest("abc"), digest("abd"));
    }
}
