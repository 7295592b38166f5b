use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;

/// Prefix of every derived address
pub const ADDRESS_PREFIX: &str = "STRAT";

/// Number of hex characters of the RIPEMD-160 digest kept in an address
const ADDRESS_HASH_CHARS: usize = 36;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

/// A ledger address
///
/// Either derived from a public key (`STRAT...`) or one of the well-known
/// markers such as the genesis owner or the contract sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    /// Derives an address from a hex-encoded public key
    pub fn from_public_key_hex(public_key_hex: &str) -> Self {
        let sha = Sha256::digest(public_key_hex.as_bytes());
        let ripemd = hex::encode(Ripemd160::digest(sha));
        Address(format!("{}{}", ADDRESS_PREFIX, &ripemd[..ADDRESS_HASH_CHARS]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address(value.to_string())
    }
}

/// SHA-256 of raw bytes as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Content hash of a JSON document
///
/// Every digest in the ledger goes through here so that two nodes hashing
/// structurally identical data always agree.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(value.to_string().as_bytes())
}

/// A secp256k1 key pair together with its derived address
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
}

impl KeyPair {
    /// Generates a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self::from_parts(secret_key, public_key)
    }

    /// Restores a key pair from a hex-encoded private key
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_hex)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        let public_key = PublicKey::from_secret_key(&Secp256k1::new(), &secret_key);

        Ok(Self::from_parts(secret_key, public_key))
    }

    fn from_parts(secret_key: SecretKey, public_key: PublicKey) -> Self {
        let address = Address::from_public_key_hex(&hex::encode(public_key.serialize()));
        KeyPair {
            secret_key,
            public_key,
            address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Compressed SEC1 public key, hex encoded
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Signs a hex-encoded 32-byte digest, returning a compact hex signature
    pub fn sign_digest(&self, digest_hex: &str) -> Result<String, CryptoError> {
        let message = digest_message(digest_hex)?;
        let signature = Secp256k1::signing_only().sign_ecdsa(&message, &self.secret_key);
        Ok(hex::encode(signature.serialize_compact()))
    }
}

fn digest_message(digest_hex: &str) -> Result<Message, CryptoError> {
    let bytes = hex::decode(digest_hex).map_err(|e| CryptoError::InvalidDigest(e.to_string()))?;
    Message::from_digest_slice(&bytes).map_err(|e| CryptoError::InvalidDigest(e.to_string()))
}

/// Verifies a compact hex signature over a hex digest
///
/// Any malformed argument yields `false`.
pub fn verify_signature(digest_hex: &str, signature_hex: &str, public_key_hex: &str) -> bool {
    let Ok(message) = digest_message(digest_hex) else {
        return false;
    };
    let Some(signature) = hex::decode(signature_hex)
        .ok()
        .and_then(|bytes| Signature::from_compact(&bytes).ok())
    else {
        return false;
    };
    let Some(public_key) = hex::decode(public_key_hex)
        .ok()
        .and_then(|bytes| PublicKey::from_slice(&bytes).ok())
    else {
        return false;
    };

    Secp256k1::verification_only()
        .verify_ecdsa(&message, &signature, &public_key)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_deterministic() {
        let a = json!({ "index": 1, "previousHash": "abc", "nonce": 7 });
        let b = json!({ "nonce": 7, "index": 1, "previousHash": "abc" });

        assert_eq!(hash_value(&a), hash_value(&a));
        assert_eq!(hash_value(&a), hash_value(&b));
        assert_eq!(hash_value(&a).len(), 64);
    }

    #[test]
    fn test_address_derivation() {
        let keypair = KeyPair::generate();
        let address = keypair.address();

        assert!(address.as_str().starts_with(ADDRESS_PREFIX));
        assert_eq!(address.as_str().len(), ADDRESS_PREFIX.len() + ADDRESS_HASH_CHARS);
        assert_eq!(*address, Address::from_public_key_hex(&keypair.public_key_hex()));
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate();
        let digest = sha256_hex(b"Hello, world!");

        let signature = keypair.sign_digest(&digest).unwrap();
        assert!(verify_signature(&digest, &signature, &keypair.public_key_hex()));

        let other_digest = sha256_hex(b"Wrong message");
        assert!(!verify_signature(&other_digest, &signature, &keypair.public_key_hex()));

        let stranger = KeyPair::generate();
        assert!(!verify_signature(&digest, &signature, &stranger.public_key_hex()));
    }

    #[test]
    fn test_malformed_inputs_do_not_verify() {
        let keypair = KeyPair::generate();
        let digest = sha256_hex(b"data");

        assert!(!verify_signature(&digest, "zz", &keypair.public_key_hex()));
        assert!(!verify_signature("short", "00", &keypair.public_key_hex()));
        assert!(!verify_signature(&digest, &"00".repeat(64), "not-a-key"));
    }

    #[test]
    fn test_restore_from_secret() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&keypair.secret_hex()).unwrap();

        assert_eq!(restored.address(), keypair.address());
        assert!(KeyPair::from_secret_hex("1234").is_err());
    }
}
