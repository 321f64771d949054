//! Message decryption: locate our key entry, unwrap, decrypt.

use chirp_shared::constants::TAG_LENGTH;
use chirp_shared::element::OmemoElement;
use chirp_shared::{BareJid, DeviceId, OmemoDevice};

use crate::engine::CryptoEngine;
use crate::error::OmemoError;
use crate::keys::IdentityKeyPair;
use crate::session;
use crate::store::OmemoStore;

/// Key material delivered without a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTransport {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Result of decrypting one inbound element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub sender: OmemoDevice,
    /// Present for regular messages.
    pub plaintext: Option<Vec<u8>>,
    /// Present for key-transport elements.
    pub key_transport: Option<KeyTransport>,
}

/// Decrypt an inbound element addressed to `own_device_id`.
///
/// Fails with `NotForUs` when no key entry matches our device id. Ratchet
/// authentication failures are classified as `Corrupted` so the caller can
/// apply its reset policy.
pub fn decrypt_element(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    our_identity: &IdentityKeyPair,
    own_device_id: DeviceId,
    sender_jid: &BareJid,
    element: &OmemoElement,
) -> Result<DecryptedMessage, OmemoError> {
    let key_element = element.key_for(own_device_id).ok_or(OmemoError::NotForUs)?;
    let sender = OmemoDevice::new(sender_jid.clone(), element.sid);

    let unwrapped = session::decrypt_key(
        engine,
        store,
        our_identity,
        &sender,
        &key_element.data,
        key_element.prekey,
    )
    .map_err(|err| classify(err, &sender))?;

    match &element.payload {
        Some(payload) => {
            if unwrapped.len() < TAG_LENGTH {
                return Err(OmemoError::Corrupted {
                    device: sender,
                    detail: "wrapped key material too short".into(),
                });
            }
            let (payload_key, auth_tag) = unwrapped.split_at(unwrapped.len() - TAG_LENGTH);

            let mut ciphertext = Vec::with_capacity(payload.len() + TAG_LENGTH);
            ciphertext.extend_from_slice(payload);
            ciphertext.extend_from_slice(auth_tag);

            let plaintext = engine
                .aead_decrypt(payload_key, &element.iv, b"", &ciphertext)
                .map_err(|err| classify(err, &sender))?;

            Ok(DecryptedMessage {
                sender,
                plaintext: Some(plaintext),
                key_transport: None,
            })
        }
        None => Ok(DecryptedMessage {
            sender,
            key_transport: Some(KeyTransport {
                key: unwrapped,
                iv: element.iv.clone(),
            }),
            plaintext: None,
        }),
    }
}

/// Map low-level unwrap failures to the receive-path taxonomy.
fn classify(err: OmemoError, sender: &OmemoDevice) -> OmemoError {
    match err {
        OmemoError::AuthFailure => OmemoError::Corrupted {
            device: sender.clone(),
            detail: "message authentication failed".into(),
        },
        other => other,
    }
}
