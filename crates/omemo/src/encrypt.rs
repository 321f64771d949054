//! Message encryption: payload keying and per-device key wrapping.
//!
//! One fresh payload key encrypts the body once; the ratchet then wraps
//! that key (with the payload's auth tag) separately for every recipient
//! device. The tag rides inside the wrapped blob, not with the ciphertext
//! body; the published payload is tagless.

use chirp_shared::constants::{AES_KEY_LENGTH, IV_LENGTH, TAG_LENGTH};
use chirp_shared::element::{KeyElement, OmemoElement};
use chirp_shared::{DeviceId, OmemoDevice};

use crate::engine::CryptoEngine;
use crate::error::OmemoError;
use crate::keys::IdentityKeyPair;
use crate::session;
use crate::store::OmemoStore;

/// A payload encrypted under a fresh single-use key.
pub struct EncryptedPayload {
    pub key: [u8; 16],
    pub iv: [u8; 12],
    /// AEAD ciphertext with the tag stripped.
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; 16],
}

impl EncryptedPayload {
    /// The material wrapped for each recipient: `key ‖ auth_tag`.
    pub fn key_material(&self) -> [u8; 32] {
        let mut material = [0u8; 32];
        material[..16].copy_from_slice(&self.key);
        material[16..].copy_from_slice(&self.auth_tag);
        material
    }
}

/// Encrypt `plaintext` under a fresh random key and IV.
pub fn encrypt_payload(
    engine: &dyn CryptoEngine,
    plaintext: &[u8],
) -> Result<EncryptedPayload, OmemoError> {
    let key: [u8; 16] = engine
        .random(AES_KEY_LENGTH)
        .try_into()
        .map_err(|_| OmemoError::Crypto("rng returned wrong length".into()))?;
    let iv: [u8; 12] = engine
        .random(IV_LENGTH)
        .try_into()
        .map_err(|_| OmemoError::Crypto("rng returned wrong length".into()))?;

    let mut ciphertext = engine.aead_encrypt(&key, &iv, b"", plaintext)?;
    if ciphertext.len() < TAG_LENGTH {
        return Err(OmemoError::Crypto("aead output shorter than tag".into()));
    }
    let tag_start = ciphertext.len() - TAG_LENGTH;
    let auth_tag: [u8; 16] = ciphertext[tag_start..]
        .try_into()
        .expect("slice is exactly TAG_LENGTH bytes");
    ciphertext.truncate(tag_start);

    Ok(EncryptedPayload {
        key,
        iv,
        ciphertext,
        auth_tag,
    })
}

/// Wrap `key_material` for every device in `recipients`.
///
/// Sessions must already exist; a missing one surfaces as `NoSession`.
fn wrap_for_devices(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    our_identity: &IdentityKeyPair,
    recipients: &[OmemoDevice],
    key_material: &[u8],
) -> Result<Vec<KeyElement>, OmemoError> {
    let mut keys = Vec::with_capacity(recipients.len());
    for device in recipients {
        let (data, prekey) =
            session::encrypt_key(engine, store, our_identity, device, key_material)?;
        keys.push(KeyElement {
            rid: device.id,
            prekey,
            data,
        });
    }
    Ok(keys)
}

/// Build a full message element: encrypted payload plus one wrapped key per
/// recipient device.
pub fn encrypt_message(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    our_identity: &IdentityKeyPair,
    own_device_id: DeviceId,
    recipients: &[OmemoDevice],
    plaintext: &[u8],
) -> Result<OmemoElement, OmemoError> {
    let payload = encrypt_payload(engine, plaintext)?;
    let keys = wrap_for_devices(
        engine,
        store,
        our_identity,
        recipients,
        &payload.key_material(),
    )?;

    Ok(OmemoElement {
        sid: own_device_id,
        iv: payload.iv.to_vec(),
        keys,
        payload: Some(payload.ciphertext),
    })
}

/// Build a key-transport element: wrapped key material, no payload.
pub fn key_transport(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    our_identity: &IdentityKeyPair,
    own_device_id: DeviceId,
    recipients: &[OmemoDevice],
    key: &[u8],
    iv: &[u8],
) -> Result<OmemoElement, OmemoError> {
    let keys = wrap_for_devices(engine, store, our_identity, recipients, key)?;
    Ok(OmemoElement {
        sid: own_device_id,
        iv: iv.to_vec(),
        keys,
        payload: None,
    })
}
