//! Key material wrappers.
//!
//! Identity keys are Ed25519; signatures use them directly, while X3DH and
//! the DH ratchet use their birationally-equivalent X25519 form. Pre-keys and
//! ratchet keys are plain X25519 pairs. All wrappers expose 32-byte
//! serializations for storage and the wire.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::OmemoError;

/// Long-term identity key pair of one device.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        IdentityKeyPair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OmemoError> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OmemoError::CorruptedKey("identity key must be 32 bytes".into()))?;
        Ok(IdentityKeyPair {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public(&self) -> IdentityKey {
        IdentityKey(self.signing.verifying_key())
    }

    /// The X25519 form of the identity secret, for X3DH agreements.
    pub fn dh_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing.to_scalar_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Public identity key of a device; the source of its fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityKey(VerifyingKey);

impl IdentityKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OmemoError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OmemoError::CorruptedKey("identity public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&raw)
            .map_err(|e| OmemoError::CorruptedKey(format!("invalid identity public key: {e}")))?;
        Ok(IdentityKey(key))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// The X25519 form of the identity public key, for X3DH agreements.
    pub fn dh_public(&self) -> X25519Public {
        X25519Public::from(self.0.to_montgomery().to_bytes())
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }
}

/// An X25519 key pair used for signed pre-keys, one-time pre-keys, X3DH base
/// keys and ratchet keys.
#[derive(Clone)]
pub struct PreKeyPair {
    secret: StaticSecret,
}

impl PreKeyPair {
    pub fn generate() -> Self {
        PreKeyPair {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OmemoError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OmemoError::CorruptedKey("pre-key secret must be 32 bytes".into()))?;
        Ok(PreKeyPair {
            secret: StaticSecret::from(raw),
        })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public(&self) -> X25519Public {
        X25519Public::from(&self.secret)
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for PreKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Parse a 32-byte X25519 public key from wire bytes.
pub fn x25519_public_from_bytes(bytes: &[u8]) -> Result<X25519Public, OmemoError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| OmemoError::CorruptedKey("x25519 public key must be 32 bytes".into()))?;
    Ok(X25519Public::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_bytes() {
        let pair = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_bytes(&pair.to_bytes()).unwrap();
        assert_eq!(pair.public(), restored.public());
    }

    #[test]
    fn identity_from_bytes_rejects_wrong_length() {
        assert!(matches!(
            IdentityKeyPair::from_bytes(&[0u8; 31]),
            Err(OmemoError::CorruptedKey(_))
        ));
    }

    #[test]
    fn identity_public_round_trips_through_bytes() {
        let public = IdentityKeyPair::generate().public();
        let restored = IdentityKey::from_bytes(&public.to_bytes()).unwrap();
        assert_eq!(public, restored);
    }

    #[test]
    fn dh_forms_of_identity_keys_agree() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let ab = alice.dh_secret().diffie_hellman(&bob.public().dh_public());
        let ba = bob.dh_secret().diffie_hellman(&alice.public().dh_public());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn pre_key_round_trips_through_bytes() {
        let pair = PreKeyPair::generate();
        let restored = PreKeyPair::from_bytes(&pair.to_bytes()).unwrap();
        assert_eq!(pair.public(), restored.public());
    }

    #[test]
    fn x25519_public_from_bytes_rejects_wrong_length() {
        assert!(x25519_public_from_bytes(&[0u8; 16]).is_err());
    }
}
