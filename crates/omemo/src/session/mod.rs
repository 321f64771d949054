//! Session engine: establishment, advancement and teardown of
//! Double-Ratchet sessions.
//!
//! The functions here tie the ratchet math to the store. A session is only
//! persisted once a step has fully succeeded, so the stored state is always
//! either usable or absent.

pub mod ratchet;
pub mod state;
pub mod x3dh;

use chirp_shared::element::BundleElement;
use chirp_shared::OmemoDevice;

use crate::engine::CryptoEngine;
use crate::error::OmemoError;
use crate::keys::{IdentityKey, IdentityKeyPair, x25519_public_from_bytes};
use crate::store::OmemoStore;

use self::ratchet::{PreKeyEnvelope, RatchetEnvelope};
use self::state::{SessionState, SessionStatus};

/// Whether a usable session with `peer` exists.
pub fn has_session(store: &dyn OmemoStore, peer: &OmemoDevice) -> Result<bool, OmemoError> {
    Ok(store.load_session(peer)?.is_some())
}

/// Establish an initiator-side session from a fetched bundle.
///
/// Verifies the signed pre-key signature, runs X3DH against one unused
/// one-time pre-key chosen at random, and atomically persists the session
/// together with the consumption record. A no-op when a session already
/// exists.
pub fn establish_outgoing(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    our_identity: &IdentityKeyPair,
    peer: &OmemoDevice,
    bundle: &BundleElement,
) -> Result<(), OmemoError> {
    if store.load_session(peer)?.is_some() {
        return Ok(());
    }

    let peer_identity = IdentityKey::from_bytes(&bundle.identity_key)?;
    engine
        .verify(
            &peer_identity,
            &bundle.signed_pre_key_public,
            &bundle.signed_pre_key_signature,
        )
        .map_err(|_| OmemoError::BadSignature(peer.clone()))?;

    let chosen = crate::bundles::select_pre_key(store, peer, bundle)?;
    let signed_pre_key = x25519_public_from_bytes(&bundle.signed_pre_key_public)?;
    let one_time = x25519_public_from_bytes(&chosen.data)?;

    let session = x3dh::initiate(
        engine,
        our_identity,
        &peer_identity,
        bundle.signed_pre_key_id,
        signed_pre_key,
        chosen.id,
        one_time,
    )?;

    store.commit_outbound_session(peer, &session, chosen.id)?;
    tracing::info!(peer = %peer, "session established from bundle");
    Ok(())
}

/// Advance the sending chain one step and wrap `key_material` for `peer`.
///
/// Returns the wrapped bytes and whether they carry the X3DH prelude.
pub fn encrypt_key(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    our_identity: &IdentityKeyPair,
    peer: &OmemoDevice,
    key_material: &[u8],
) -> Result<(Vec<u8>, bool), OmemoError> {
    let mut session = store
        .load_session(peer)?
        .ok_or_else(|| OmemoError::NoSession(peer.clone()))?;

    let message = ratchet::encrypt_step(engine, &mut session, key_material)?;
    let (wrapped, is_prekey) = match &session.pending {
        Some(pending) => {
            let envelope = PreKeyEnvelope {
                identity_key: our_identity.public().to_bytes(),
                base_key: pending.base_key,
                signed_pre_key_id: pending.signed_pre_key_id,
                pre_key_id: pending.pre_key_id,
                message,
            };
            (envelope.to_bytes()?, true)
        }
        None => (message.to_bytes()?, false),
    };

    store.store_session(peer, &session)?;
    Ok((wrapped, is_prekey))
}

/// Unwrap key material received from `peer`.
///
/// For pre-key messages this may create the session first, consuming the
/// referenced one-time pre-key atomically with the session commit. A
/// pre-key message for an already-derived session (same base key) is
/// processed over the existing session without consuming anything again.
pub fn decrypt_key(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    our_identity: &IdentityKeyPair,
    peer: &OmemoDevice,
    wrapped: &[u8],
    is_prekey: bool,
) -> Result<Vec<u8>, OmemoError> {
    if !is_prekey {
        let envelope = RatchetEnvelope::from_bytes(wrapped).map_err(|_| OmemoError::Corrupted {
            device: peer.clone(),
            detail: "malformed ratchet envelope".into(),
        })?;
        let session = store
            .load_session(peer)?
            .ok_or_else(|| OmemoError::NoSession(peer.clone()))?;
        return advance_inbound(engine, store, peer, session, &envelope, None);
    }

    let envelope = PreKeyEnvelope::from_bytes(wrapped).map_err(|_| OmemoError::Corrupted {
        device: peer.clone(),
        detail: "malformed pre-key envelope".into(),
    })?;

    if let Some(session) = store.load_session(peer)? {
        if session.alice_base_key == Some(envelope.base_key) {
            // Re-delivery of the prelude for a session we already derived.
            return advance_inbound(engine, store, peer, session, &envelope.message, None);
        }
        tracing::info!(peer = %peer, "pre-key message replaces existing session");
    }

    let signed_pre_key = store
        .signed_pre_key(envelope.signed_pre_key_id)?
        .ok_or_else(|| OmemoError::Corrupted {
            device: peer.clone(),
            detail: format!("unknown signed pre-key id {}", envelope.signed_pre_key_id),
        })?;
    let one_time = store
        .pre_key(envelope.pre_key_id)?
        .ok_or_else(|| OmemoError::Corrupted {
            device: peer.clone(),
            detail: format!("one-time pre-key {} unavailable", envelope.pre_key_id),
        })?;

    let session = x3dh::respond(engine, our_identity, &signed_pre_key, &one_time, &envelope)?;
    advance_inbound(
        engine,
        store,
        peer,
        session,
        &envelope.message,
        Some(envelope.pre_key_id),
    )
}

/// Run a ratchet decrypt over `session` and commit the advanced state.
fn advance_inbound(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    peer: &OmemoDevice,
    mut session: SessionState,
    envelope: &RatchetEnvelope,
    consume_pre_key: Option<u32>,
) -> Result<Vec<u8>, OmemoError> {
    let key_material = ratchet::decrypt_step(engine, &mut session, envelope)?;

    if session.status == SessionStatus::PendingX3dh {
        session.status = SessionStatus::Established;
        tracing::info!(peer = %peer, "session established");
    }
    // Any inbound ratchet message proves the peer holds the session; stop
    // sending the prelude.
    session.pending = None;

    match consume_pre_key {
        Some(id) => store.commit_inbound_session(peer, &session, Some(id))?,
        None => store.store_session(peer, &session)?,
    }
    Ok(key_material)
}

/// Delete the session with `peer`; the next send rebuilds from a fresh
/// bundle.
pub fn reset(store: &dyn OmemoStore, peer: &OmemoDevice) -> Result<(), OmemoError> {
    store.delete_session(peer)?;
    tracing::info!(peer = %peer, "session reset");
    Ok(())
}

/// Number of skipped message keys currently stored for `peer`.
pub fn skipped_key_count(store: &dyn OmemoStore, peer: &OmemoDevice) -> Result<usize, OmemoError> {
    Ok(store
        .load_session(peer)?
        .map(|s| s.skipped.len())
        .unwrap_or(0))
}

/// Drop skipped message keys older than `max_age_secs` across all sessions.
/// Returns the number removed.
pub fn prune_skipped_keys(
    store: &dyn OmemoStore,
    max_age_secs: u64,
) -> Result<usize, OmemoError> {
    let cutoff = crate::store::unix_now() - max_age_secs as i64;
    let mut removed = 0;
    for device in store.session_devices()? {
        if let Some(mut session) = store.load_session(&device)? {
            let dropped = session.prune_skipped_before(cutoff);
            if dropped > 0 {
                store.store_session(&device, &session)?;
                removed += dropped;
            }
        }
    }
    Ok(removed)
}
