//! Receive pipeline types and listener dispatch.
//!
//! Direct messages, carbon copies and archive replays all funnel through the
//! same decryption path; what differs is the provenance recorded in
//! [`MessageInfo`]. Listener dispatch is synchronous; listeners that need to
//! publish in response must hand that work off, or they will deadlock the
//! transport's notification thread.

use std::sync::{Arc, Mutex};

use crate::decrypt::{DecryptedMessage, KeyTransport};
use chirp_shared::OmemoDevice;

/// Direction of a carbon copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarbonDirection {
    /// Copy of a message another of our devices sent.
    Sent,
    /// Copy of a message another of our devices received.
    Received,
}

/// Where an inbound element came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Direct,
    Carbon(CarbonDirection),
    Archive,
}

/// Metadata delivered alongside every decrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub sender: OmemoDevice,
    /// Fingerprint of the sender device's identity key.
    pub fingerprint: String,
    pub was_carbon: bool,
    pub was_archive: bool,
}

impl MessageInfo {
    pub fn new(sender: OmemoDevice, fingerprint: String, provenance: Provenance) -> Self {
        MessageInfo {
            sender,
            fingerprint,
            was_carbon: matches!(provenance, Provenance::Carbon(_)),
            was_archive: matches!(provenance, Provenance::Archive),
        }
    }
}

/// Receiver-side observer for decrypted traffic.
pub trait OmemoMessageListener: Send + Sync {
    fn message_received(&self, plaintext: &[u8], info: &MessageInfo);

    fn key_transport_received(&self, transport: &KeyTransport, info: &MessageInfo);
}

/// Fan-out point for decrypted messages.
#[derive(Default)]
pub struct ReceivePipeline {
    listeners: Mutex<Vec<Arc<dyn OmemoMessageListener>>>,
}

impl ReceivePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn OmemoMessageListener>) {
        self.listeners.lock().expect("listener lock").push(listener);
    }

    /// Unregister a previously added listener. Matching is by identity, so
    /// pass the same `Arc` that was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn OmemoMessageListener>) {
        self.listeners
            .lock()
            .expect("listener lock")
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Deliver a decrypted element to every registered listener.
    pub fn dispatch(&self, message: &DecryptedMessage, info: &MessageInfo) {
        let listeners = self.listeners.lock().expect("listener lock").clone();
        for listener in listeners {
            if let Some(plaintext) = &message.plaintext {
                listener.message_received(plaintext, info);
            }
            if let Some(transport) = &message.key_transport {
                listener.key_transport_received(transport, info);
            }
        }
    }
}
