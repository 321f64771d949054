//! Cryptographic primitive provider.
//!
//! The engine trait bundles every primitive the protocol code needs so that
//! session and message logic never touches a cipher directly. The default
//! implementation follows the axolotl profile: AES-128-GCM payload
//! encryption, Ed25519 signatures, X25519 agreements.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, Verifier};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::OmemoError;
use crate::keys::{IdentityKey, IdentityKeyPair, PreKeyPair};

/// Primitives consumed by the OMEMO engine.
pub trait CryptoEngine: Send + Sync {
    fn generate_identity(&self) -> IdentityKeyPair;

    fn generate_pre_key(&self) -> PreKeyPair;

    /// Sign `message` with the identity key.
    fn sign(&self, identity: &IdentityKeyPair, message: &[u8]) -> Vec<u8>;

    /// Verify an identity-key signature.
    fn verify(
        &self,
        identity: &IdentityKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), OmemoError>;

    /// X25519 agreement between a local secret and a remote public key.
    fn agree(&self, secret: &StaticSecret, public: &X25519Public) -> [u8; 32];

    fn random(&self, len: usize) -> Vec<u8>;

    /// AEAD-encrypt; the returned ciphertext has the 16-byte tag appended.
    fn aead_encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, OmemoError>;

    /// Inverse of [`CryptoEngine::aead_encrypt`]; fails with `AuthFailure`
    /// on tag mismatch.
    fn aead_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, OmemoError>;

    /// Lowercase-hex fingerprint of an identity public key, 64 characters.
    fn fingerprint(&self, identity: &IdentityKey) -> String;
}

/// Default engine for the axolotl profile.
#[derive(Debug, Clone, Default)]
pub struct AxolotlEngine {
    /// Accept 32-byte AEAD keys (AES-256-GCM) in addition to the profile's
    /// 16-byte keys.
    pub accept_aes256: bool,
}

impl AxolotlEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoEngine for AxolotlEngine {
    fn generate_identity(&self) -> IdentityKeyPair {
        IdentityKeyPair::generate()
    }

    fn generate_pre_key(&self) -> PreKeyPair {
        PreKeyPair::generate()
    }

    fn sign(&self, identity: &IdentityKeyPair, message: &[u8]) -> Vec<u8> {
        identity.signing_key().sign(message).to_bytes().to_vec()
    }

    fn verify(
        &self,
        identity: &IdentityKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), OmemoError> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| OmemoError::Crypto(format!("malformed signature: {e}")))?;
        identity
            .verifying_key()
            .verify(message, &signature)
            .map_err(|e| OmemoError::Crypto(format!("signature verification failed: {e}")))
    }

    fn agree(&self, secret: &StaticSecret, public: &X25519Public) -> [u8; 32] {
        secret.diffie_hellman(public).to_bytes()
    }

    fn random(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes
    }

    fn aead_encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, OmemoError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match key.len() {
            16 => {
                let cipher = Aes128Gcm::new_from_slice(key)
                    .map_err(|e| OmemoError::Crypto(e.to_string()))?;
                cipher
                    .encrypt(Nonce::from_slice(iv), payload)
                    .map_err(|_| OmemoError::Crypto("aead encryption failed".into()))
            }
            32 if self.accept_aes256 => {
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| OmemoError::Crypto(e.to_string()))?;
                cipher
                    .encrypt(Nonce::from_slice(iv), payload)
                    .map_err(|_| OmemoError::Crypto("aead encryption failed".into()))
            }
            len => Err(OmemoError::Crypto(format!("unsupported aead key length: {len}"))),
        }
    }

    fn aead_decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, OmemoError> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match key.len() {
            16 => {
                let cipher = Aes128Gcm::new_from_slice(key)
                    .map_err(|e| OmemoError::Crypto(e.to_string()))?;
                cipher
                    .decrypt(Nonce::from_slice(iv), payload)
                    .map_err(|_| OmemoError::AuthFailure)
            }
            32 if self.accept_aes256 => {
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| OmemoError::Crypto(e.to_string()))?;
                cipher
                    .decrypt(Nonce::from_slice(iv), payload)
                    .map_err(|_| OmemoError::AuthFailure)
            }
            len => Err(OmemoError::Crypto(format!("unsupported aead key length: {len}"))),
        }
    }

    fn fingerprint(&self, identity: &IdentityKey) -> String {
        hex::encode(Sha256::digest(identity.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chirp_shared::constants::{AES_KEY_LENGTH, FINGERPRINT_LENGTH, IV_LENGTH, TAG_LENGTH};

    fn engine() -> AxolotlEngine {
        AxolotlEngine::new()
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let engine = engine();
        let identity = engine.generate_identity();
        let signature = engine.sign(&identity, b"signed pre-key public");
        engine
            .verify(&identity.public(), b"signed pre-key public", &signature)
            .unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let engine = engine();
        let identity = engine.generate_identity();
        let signature = engine.sign(&identity, b"original");
        assert!(engine
            .verify(&identity.public(), b"tampered", &signature)
            .is_err());
    }

    #[test]
    fn verify_rejects_malformed_signature() {
        let engine = engine();
        let identity = engine.generate_identity();
        assert!(engine
            .verify(&identity.public(), b"message", &[0u8; 7])
            .is_err());
    }

    #[test]
    fn agreement_is_symmetric() {
        let engine = engine();
        let a = engine.generate_pre_key();
        let b = engine.generate_pre_key();
        assert_eq!(
            engine.agree(a.secret(), &b.public()),
            engine.agree(b.secret(), &a.public())
        );
    }

    #[test]
    fn aead_round_trips_and_appends_tag() {
        let engine = engine();
        let key = engine.random(AES_KEY_LENGTH);
        let iv = engine.random(IV_LENGTH);

        let ciphertext = engine.aead_encrypt(&key, &iv, b"aad", b"hello").unwrap();
        assert_eq!(ciphertext.len(), b"hello".len() + TAG_LENGTH);

        let plaintext = engine.aead_decrypt(&key, &iv, b"aad", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn aead_decrypt_fails_on_wrong_aad() {
        let engine = engine();
        let key = engine.random(AES_KEY_LENGTH);
        let iv = engine.random(IV_LENGTH);
        let ciphertext = engine.aead_encrypt(&key, &iv, b"aad", b"hello").unwrap();
        assert!(matches!(
            engine.aead_decrypt(&key, &iv, b"other", &ciphertext),
            Err(OmemoError::AuthFailure)
        ));
    }

    #[test]
    fn aead_decrypt_fails_on_flipped_ciphertext_byte() {
        let engine = engine();
        let key = engine.random(AES_KEY_LENGTH);
        let iv = engine.random(IV_LENGTH);
        let mut ciphertext = engine.aead_encrypt(&key, &iv, b"", b"hello").unwrap();
        ciphertext[0] ^= 0xFF;
        assert!(matches!(
            engine.aead_decrypt(&key, &iv, b"", &ciphertext),
            Err(OmemoError::AuthFailure)
        ));
    }

    #[test]
    fn aes256_requires_capability_flag() {
        let strict = AxolotlEngine::new();
        let key = strict.random(32);
        let iv = strict.random(IV_LENGTH);
        assert!(strict.aead_encrypt(&key, &iv, b"", b"x").is_err());

        let permissive = AxolotlEngine {
            accept_aes256: true,
        };
        let ciphertext = permissive.aead_encrypt(&key, &iv, b"", b"x").unwrap();
        assert_eq!(permissive.aead_decrypt(&key, &iv, b"", &ciphertext).unwrap(), b"x");
    }

    #[test]
    fn fingerprint_is_64_lowercase_hex_chars() {
        let engine = engine();
        let identity = engine.generate_identity();
        let fp = engine.fingerprint(&identity.public());
        assert_eq!(fp.len(), FINGERPRINT_LENGTH);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_is_stable_per_identity() {
        let engine = engine();
        let identity = engine.generate_identity();
        assert_eq!(
            engine.fingerprint(&identity.public()),
            engine.fingerprint(&identity.public())
        );

        let other = engine.generate_identity();
        assert_ne!(
            engine.fingerprint(&identity.public()),
            engine.fingerprint(&other.public())
        );
    }

    #[test]
    fn random_produces_requested_length() {
        let engine = engine();
        assert_eq!(engine.random(16).len(), 16);
        let a = engine.random(16);
        let b = engine.random(16);
        assert_ne!(a, b);
    }
}
