//! Typed wire elements.
//!
//! These structs are the in-memory form of the `encrypted`, `list` and
//! `bundle` elements from the axolotl namespace. Transport adapters map them
//! to and from XML; the engine never sees markup. Binary fields hold raw
//! bytes here and are base64-encoded only at the XML boundary (helpers at the
//! bottom of this module).

use std::collections::BTreeSet;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// One `key` child of an OMEMO header: the payload key wrapped for a single
/// recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyElement {
    /// Recipient device id (`rid` attribute).
    pub rid: DeviceId,
    /// Whether the wrapped material carries an X3DH pre-key prelude.
    pub prekey: bool,
    /// The wrapped key material.
    pub data: Vec<u8>,
}

/// The `encrypted` element: one envelope per outbound message.
///
/// `payload` is the AEAD ciphertext with the 16-byte auth tag stripped; the
/// tag travels inside each recipient's wrapped key blob. A missing payload
/// makes this a key-transport element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmemoElement {
    /// Sender device id (`sid` attribute).
    pub sid: DeviceId,
    /// 12-byte GCM initialization vector.
    pub iv: Vec<u8>,
    /// Wrapped payload key, one entry per recipient device.
    pub keys: Vec<KeyElement>,
    /// AEAD ciphertext without auth tag; `None` for key-transport elements.
    pub payload: Option<Vec<u8>>,
}

impl OmemoElement {
    /// Find the wrapped key addressed to `rid`, if any.
    pub fn key_for(&self, rid: DeviceId) -> Option<&KeyElement> {
        self.keys.iter().find(|k| k.rid == rid)
    }

    /// True when this element transports a key without a message body.
    pub fn is_key_transport(&self) -> bool {
        self.payload.is_none()
    }
}

/// The published `list` element: active device ids of one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListElement {
    pub device_ids: BTreeSet<DeviceId>,
}

impl DeviceListElement {
    pub fn new(device_ids: BTreeSet<DeviceId>) -> Self {
        DeviceListElement { device_ids }
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.device_ids.contains(&id)
    }
}

impl FromIterator<DeviceId> for DeviceListElement {
    fn from_iter<I: IntoIterator<Item = DeviceId>>(iter: I) -> Self {
        DeviceListElement {
            device_ids: iter.into_iter().collect(),
        }
    }
}

/// One `preKeyPublic` child of a published bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyPublicElement {
    pub id: u32,
    pub data: Vec<u8>,
}

/// The published `bundle` element for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleElement {
    /// Public identity key of the publishing device.
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: Vec<u8>,
    /// Signature over the signed pre-key public, by the identity key.
    pub signed_pre_key_signature: Vec<u8>,
    /// Currently published one-time pre-keys.
    pub pre_keys: Vec<PreKeyPublicElement>,
}

impl BundleElement {
    pub fn pre_key(&self, id: u32) -> Option<&PreKeyPublicElement> {
        self.pre_keys.iter().find(|p| p.id == id)
    }
}

/// Base64 encoding used for all binary wire content.
pub fn encode_b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Inverse of [`encode_b64`].
pub fn decode_b64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn did(id: u32) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn sample_element() -> OmemoElement {
        OmemoElement {
            sid: did(1001),
            iv: vec![0u8; 12],
            keys: vec![
                KeyElement {
                    rid: did(2001),
                    prekey: true,
                    data: vec![1, 2, 3],
                },
                KeyElement {
                    rid: did(2002),
                    prekey: false,
                    data: vec![4, 5, 6],
                },
            ],
            payload: Some(vec![9, 9, 9]),
        }
    }

    #[test]
    fn key_for_finds_matching_recipient() {
        let element = sample_element();
        let key = element.key_for(did(2002)).unwrap();
        assert_eq!(key.data, vec![4, 5, 6]);
        assert!(!key.prekey);
    }

    #[test]
    fn key_for_returns_none_for_unknown_recipient() {
        let element = sample_element();
        assert!(element.key_for(did(9999)).is_none());
    }

    #[test]
    fn element_without_payload_is_key_transport() {
        let mut element = sample_element();
        assert!(!element.is_key_transport());
        element.payload = None;
        assert!(element.is_key_transport());
    }

    #[test]
    fn device_list_from_iterator_deduplicates() {
        let list: DeviceListElement = [did(1), did(2), did(1)].into_iter().collect();
        assert_eq!(list.device_ids.len(), 2);
        assert!(list.contains(did(1)));
        assert!(!list.contains(did(3)));
    }

    #[test]
    fn bundle_pre_key_lookup_by_id() {
        let bundle = BundleElement {
            identity_key: vec![1],
            signed_pre_key_id: 5,
            signed_pre_key_public: vec![2],
            signed_pre_key_signature: vec![3],
            pre_keys: vec![
                PreKeyPublicElement { id: 10, data: vec![10] },
                PreKeyPublicElement { id: 11, data: vec![11] },
            ],
        };
        assert_eq!(bundle.pre_key(11).unwrap().data, vec![11]);
        assert!(bundle.pre_key(12).is_none());
    }

    #[test]
    fn b64_round_trips() {
        let data = vec![0u8, 255, 16, 32];
        let encoded = encode_b64(&data);
        assert_eq!(decode_b64(&encoded).unwrap(), data);
    }

    #[test]
    fn element_serde_round_trips() {
        let element = sample_element();
        let json = serde_json::to_string(&element).unwrap();
        let back: OmemoElement = serde_json::from_str(&json).unwrap();
        assert_eq!(element, back);
    }
}
