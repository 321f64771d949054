//! Bundle management: own published material and consumption of peers'.
//!
//! A bundle advertises everything a stranger needs to start a session with
//! this device: the identity key, the current signed pre-key with its
//! signature, and a pool of one-time pre-keys. The pool is replenished
//! eagerly and the signed pre-key rotated on a schedule, keeping the
//! previous generation around for late deliveries.

use rand::seq::SliceRandom;

use chirp_shared::element::{BundleElement, PreKeyPublicElement};
use chirp_shared::OmemoDevice;

use crate::engine::CryptoEngine;
use crate::error::OmemoError;
use crate::store::{unix_now, OmemoStore, PreKeyRecord, SignedPreKeyRecord};

/// Top up the one-time pre-key pool to `target`. Returns how many keys were
/// generated.
pub fn ensure_pre_key_pool(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    target: u32,
) -> Result<u32, OmemoError> {
    let current = store.pre_key_count()?;
    if current >= target {
        return Ok(0);
    }

    let start_id = store.next_pre_key_id()?;
    let missing = target - current;
    let records: Vec<PreKeyRecord> = (0..missing)
        .map(|offset| PreKeyRecord::new(start_id + offset, &engine.generate_pre_key()))
        .collect();
    store.store_pre_keys(&records)?;
    tracing::debug!(added = missing, pool = target, "replenished one-time pre-key pool");
    Ok(missing)
}

/// Whether the pool has dropped below the refill threshold.
pub fn needs_replenishment(store: &dyn OmemoStore, low_water: u32) -> Result<bool, OmemoError> {
    Ok(store.pre_key_count()? < low_water)
}

/// Generate, sign and persist a new signed pre-key generation.
pub fn rotate_signed_pre_key(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
) -> Result<SignedPreKeyRecord, OmemoError> {
    let identity = store.load_identity()?.ok_or(OmemoError::NotInitialized)?;
    let pair = engine.generate_pre_key();
    let public = pair.public().to_bytes();
    let record = SignedPreKeyRecord {
        id: store.next_signed_pre_key_id()?,
        secret: pair.to_bytes(),
        public,
        signature: engine.sign(&identity, &public),
        created_at: unix_now(),
    };
    store.store_signed_pre_key(&record)?;
    tracing::info!(id = record.id, "rotated signed pre-key");
    Ok(record)
}

/// True when no signed pre-key exists or the current one is older than
/// `max_age_days`.
pub fn signed_pre_key_is_stale(
    store: &dyn OmemoStore,
    max_age_days: u32,
) -> Result<bool, OmemoError> {
    match store.current_signed_pre_key()? {
        None => Ok(true),
        Some(record) => {
            let max_age_secs = i64::from(max_age_days) * 86400;
            Ok(unix_now() - record.created_at > max_age_secs)
        }
    }
}

/// Drop signed pre-key generations older than the grace window. The current
/// generation is always kept.
pub fn prune_signed_pre_keys(
    store: &dyn OmemoStore,
    grace_days: u32,
) -> Result<u32, OmemoError> {
    let cutoff = unix_now() - i64::from(grace_days) * 86400;
    let deleted = store.delete_signed_pre_keys_before(cutoff)?;
    if deleted > 0 {
        tracing::info!(deleted, "pruned expired signed pre-keys");
    }
    Ok(deleted)
}

/// Build this device's bundle from current key material.
pub fn build_bundle(store: &dyn OmemoStore) -> Result<BundleElement, OmemoError> {
    let identity = store.load_identity()?.ok_or(OmemoError::NotInitialized)?;
    let signed = store
        .current_signed_pre_key()?
        .ok_or(OmemoError::NotInitialized)?;
    let pre_keys = store
        .all_pre_keys()?
        .iter()
        .map(|record| PreKeyPublicElement {
            id: record.id,
            data: record.public.to_vec(),
        })
        .collect();

    Ok(BundleElement {
        identity_key: identity.public().to_bytes().to_vec(),
        signed_pre_key_id: signed.id,
        signed_pre_key_public: signed.public.to_vec(),
        signed_pre_key_signature: signed.signature.clone(),
        pre_keys,
    })
}

/// Pick one one-time pre-key from a fetched bundle, uniformly at random
/// among those not yet consumed for this peer device.
///
/// Fails with `NoBundle` when every published pre-key has already been
/// consumed locally; the peer needs to republish.
pub fn select_pre_key(
    store: &dyn OmemoStore,
    peer: &OmemoDevice,
    bundle: &BundleElement,
) -> Result<PreKeyPublicElement, OmemoError> {
    let mut unused = Vec::with_capacity(bundle.pre_keys.len());
    for pre_key in &bundle.pre_keys {
        if !store.bundle_pre_key_used(peer, pre_key.id)? {
            unused.push(pre_key);
        }
    }
    unused
        .choose(&mut rand::thread_rng())
        .map(|&p| p.clone())
        .ok_or_else(|| OmemoError::NoBundle(peer.clone()))
}
