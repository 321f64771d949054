//! Persisted Double-Ratchet session state.
//!
//! A session is stored as one record per `(own device, peer device)` pair.
//! State is only ever persisted after a protocol step has fully succeeded;
//! callers mutate a copy and commit it, so a failed step leaves the stored
//! session untouched.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::OmemoError;
use crate::keys::{IdentityKey, PreKeyPair};

/// Lifecycle of a session.
///
/// Absent sessions have no state record at all; deletion is the
/// `Terminated` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// We initiated via X3DH and have not yet seen a reply; outbound
    /// messages carry the pre-key prelude.
    PendingX3dh,
    /// Both sides have ratcheted; plain ratchet messages from here on.
    Established,
}

/// X3DH prelude data repeated on every outbound message until the peer
/// acknowledges by sending a ratchet message back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: u32,
    pub signed_pre_key_id: u32,
    /// Our ephemeral X3DH base key (public).
    pub base_key: [u8; 32],
}

/// A message key put aside for an out-of-order message.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SkippedKey {
    /// Ratchet public key of the chain this key belongs to.
    #[zeroize(skip)]
    pub ratchet_key: [u8; 32],
    /// Message number within that chain.
    #[zeroize(skip)]
    pub counter: u32,
    pub message_key: [u8; 32],
    /// Unix seconds; used for age-based pruning.
    #[zeroize(skip)]
    pub stored_at: i64,
}

impl std::fmt::Debug for SkippedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkippedKey")
            .field("counter", &self.counter)
            .field("stored_at", &self.stored_at)
            .finish_non_exhaustive()
    }
}

/// Full Double-Ratchet state for one peer device.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionState {
    #[zeroize(skip)]
    pub status: SessionStatus,
    /// Ed25519 identity public key of the peer device.
    #[zeroize(skip)]
    pub remote_identity: [u8; 32],
    pub root_key: [u8; 32],
    /// Our current ratchet key pair.
    pub dhs_secret: [u8; 32],
    #[zeroize(skip)]
    pub dhs_public: [u8; 32],
    /// Peer's current ratchet public key, once seen.
    #[zeroize(skip)]
    pub dhr: Option<[u8; 32]>,
    /// Sending chain key and counter.
    pub cks: Option<[u8; 32]>,
    #[zeroize(skip)]
    pub ns: u32,
    /// Receiving chain key and counter.
    pub ckr: Option<[u8; 32]>,
    #[zeroize(skip)]
    pub nr: u32,
    /// Length of the previous sending chain.
    #[zeroize(skip)]
    pub pn: u32,
    /// Present while we still owe the peer the X3DH prelude.
    #[zeroize(skip)]
    pub pending: Option<PendingPreKey>,
    /// Responder side: the initiator base key this session was derived
    /// from, used to recognize re-delivered pre-key messages.
    #[zeroize(skip)]
    pub alice_base_key: Option<[u8; 32]>,
    /// Keys set aside for out-of-order messages.
    pub skipped: Vec<SkippedKey>,
    /// X3DH associated data: initiator identity key, then responder
    /// identity key.
    #[zeroize(skip)]
    pub associated_data: Vec<u8>,
}

impl SessionState {
    pub fn remote_identity_key(&self) -> Result<IdentityKey, OmemoError> {
        IdentityKey::from_bytes(&self.remote_identity)
    }

    pub fn ratchet_key_pair(&self) -> Result<PreKeyPair, OmemoError> {
        PreKeyPair::from_bytes(&self.dhs_secret)
    }

    /// Remove a stored skipped key matching `(ratchet_key, counter)`.
    pub fn take_skipped(&mut self, ratchet_key: &[u8; 32], counter: u32) -> Option<[u8; 32]> {
        let index = self
            .skipped
            .iter()
            .position(|s| &s.ratchet_key == ratchet_key && s.counter == counter)?;
        Some(self.skipped.remove(index).message_key)
    }

    /// Drop skipped keys stored before `cutoff` (unix seconds). Returns the
    /// number removed.
    pub fn prune_skipped_before(&mut self, cutoff: i64) -> usize {
        let before = self.skipped.len();
        self.skipped.retain(|s| s.stored_at >= cutoff);
        before - self.skipped.len()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("status", &self.status)
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .field("pn", &self.pn)
            .field("pending", &self.pending.is_some())
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}
