//! Key storage layer.
//!
//! [`OmemoStore`] is the persistence boundary of the engine: identity,
//! pre-keys, sessions, cached device lists and remote identities. All
//! methods are synchronous and must be durable on return. Multi-entity
//! commits (`commit_outbound_session`, `commit_inbound_session`) are
//! required to be atomic; the bundled SQLite backend wraps them in one
//! transaction.

pub mod sqlite;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use chirp_shared::{BareJid, DeviceId, OmemoDevice};

use crate::error::OmemoError;
use crate::keys::{IdentityKeyPair, PreKeyPair};
use crate::registry::CachedDeviceList;
use crate::session::state::SessionState;

pub use sqlite::{init_test_db, SqliteStore};

/// A stored one-time pre-key.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PreKeyRecord {
    #[zeroize(skip)]
    pub id: u32,
    pub secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
}

impl PreKeyRecord {
    pub fn new(id: u32, pair: &PreKeyPair) -> Self {
        PreKeyRecord {
            id,
            secret: pair.to_bytes(),
            public: pair.public().to_bytes(),
        }
    }

    pub fn key_pair(&self) -> Result<PreKeyPair, OmemoError> {
        PreKeyPair::from_bytes(&self.secret)
    }
}

impl std::fmt::Debug for PreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyRecord")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A stored signed pre-key generation.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKeyRecord {
    #[zeroize(skip)]
    pub id: u32,
    pub secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
    /// Identity-key signature over `public`.
    #[zeroize(skip)]
    pub signature: Vec<u8>,
    /// Unix seconds at creation; drives rotation and grace pruning.
    #[zeroize(skip)]
    pub created_at: i64,
}

impl SignedPreKeyRecord {
    pub fn key_pair(&self) -> Result<PreKeyPair, OmemoError> {
        PreKeyPair::from_bytes(&self.secret)
    }
}

impl std::fmt::Debug for SignedPreKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKeyRecord")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Persistence boundary of the OMEMO engine.
///
/// Implementations must make every method durable before returning and the
/// `commit_*` methods atomic, otherwise a crash can desync ratchet state
/// from consumed key material.
pub trait OmemoStore: Send {
    // -- identity and local devices --

    fn load_identity(&self) -> Result<Option<IdentityKeyPair>, OmemoError>;

    /// Store the identity key pair. Fails if one already exists; replacing
    /// an identity would break every existing session.
    fn store_identity(&self, identity: &IdentityKeyPair) -> Result<(), OmemoError>;

    /// Device ids this installation has used for `owner`, ascending.
    fn local_device_ids(&self, owner: &BareJid) -> Result<Vec<DeviceId>, OmemoError>;

    fn add_local_device_id(&self, owner: &BareJid, id: DeviceId) -> Result<(), OmemoError>;

    // -- one-time pre-keys --

    fn store_pre_keys(&self, records: &[PreKeyRecord]) -> Result<(), OmemoError>;

    fn pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, OmemoError>;

    fn remove_pre_key(&self, id: u32) -> Result<(), OmemoError>;

    fn pre_key_count(&self) -> Result<u32, OmemoError>;

    fn all_pre_keys(&self) -> Result<Vec<PreKeyRecord>, OmemoError>;

    /// Next free one-time pre-key id; never reuses an id, even after
    /// consumption.
    fn next_pre_key_id(&self) -> Result<u32, OmemoError>;

    // -- signed pre-keys --

    fn store_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), OmemoError>;

    fn signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, OmemoError>;

    /// The most recently created signed pre-key.
    fn current_signed_pre_key(&self) -> Result<Option<SignedPreKeyRecord>, OmemoError>;

    fn next_signed_pre_key_id(&self) -> Result<u32, OmemoError>;

    /// Delete signed pre-keys created before `cutoff` (unix seconds),
    /// always keeping the newest one. Returns the number deleted.
    fn delete_signed_pre_keys_before(&self, cutoff: i64) -> Result<u32, OmemoError>;

    // -- sessions --

    fn load_session(&self, device: &OmemoDevice) -> Result<Option<SessionState>, OmemoError>;

    fn store_session(&self, device: &OmemoDevice, state: &SessionState)
        -> Result<(), OmemoError>;

    fn delete_session(&self, device: &OmemoDevice) -> Result<(), OmemoError>;

    /// Every device a session record exists for.
    fn session_devices(&self) -> Result<Vec<OmemoDevice>, OmemoError>;

    /// Atomically persist an initiator-side session, record the consumed
    /// bundle pre-key id for this peer, and store the peer identity.
    fn commit_outbound_session(
        &self,
        device: &OmemoDevice,
        state: &SessionState,
        used_bundle_pre_key_id: u32,
    ) -> Result<(), OmemoError>;

    /// Atomically persist a responder-side session, delete the consumed
    /// one-time pre-key (if any) and store the peer identity.
    fn commit_inbound_session(
        &self,
        device: &OmemoDevice,
        state: &SessionState,
        consumed_pre_key_id: Option<u32>,
    ) -> Result<(), OmemoError>;

    /// Whether `pre_key_id` from this peer's bundle was already consumed by
    /// an earlier session establishment.
    fn bundle_pre_key_used(&self, device: &OmemoDevice, pre_key_id: u32)
        -> Result<bool, OmemoError>;

    // -- remote identities --

    fn store_remote_identity(
        &self,
        device: &OmemoDevice,
        identity_key: &[u8],
    ) -> Result<(), OmemoError>;

    fn remote_identity(&self, device: &OmemoDevice) -> Result<Option<Vec<u8>>, OmemoError>;

    // -- device lists --

    fn load_device_list(&self, owner: &BareJid) -> Result<Option<CachedDeviceList>, OmemoError>;

    fn store_device_list(
        &self,
        owner: &BareJid,
        list: &CachedDeviceList,
    ) -> Result<(), OmemoError>;

    /// Unix seconds of the last successful refresh of `owner`'s list.
    fn device_list_refreshed_at(&self, owner: &BareJid) -> Result<Option<i64>, OmemoError>;
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
