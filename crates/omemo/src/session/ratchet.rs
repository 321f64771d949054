//! Double-Ratchet steps and the wrapped-key envelopes.
//!
//! Follows the Signal specification: a DH ratchet keyed by X25519 exchanges
//! and a symmetric KDF chain per direction. The "plaintext" at this layer is
//! always key material (payload key and auth tag), never the message body.
//!
//! Every step mutates a caller-owned copy of [`SessionState`]; nothing here
//! persists anything, so a failed step cannot leave half-advanced state
//! behind.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519Public;

use crate::engine::CryptoEngine;
use crate::error::OmemoError;
use crate::session::state::{SessionState, SkippedKey};
use crate::store::unix_now;

type HmacSha256 = Hmac<Sha256>;

/// Maximum number of message keys a single chain may skip over.
pub const MAX_SKIP: u32 = 1000;

const ROOT_INFO: &[u8] = b"OMEMO Root Chain";
const MESSAGE_INFO: &[u8] = b"OMEMO Message Keys";

/// A plain ratchet message: header plus wrapped key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetEnvelope {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub previous_counter: u32,
    /// Index of this message in the current sending chain.
    pub counter: u32,
    /// AEAD ciphertext over the payload key material.
    pub ciphertext: Vec<u8>,
}

impl RatchetEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, OmemoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OmemoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A ratchet message carrying the X3DH prelude, sent until the peer
/// acknowledges the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyEnvelope {
    /// Sender's identity public key (Ed25519).
    pub identity_key: [u8; 32],
    /// Sender's ephemeral X3DH base key.
    pub base_key: [u8; 32],
    pub signed_pre_key_id: u32,
    /// The one-time pre-key consumed from the recipient's bundle.
    pub pre_key_id: u32,
    pub message: RatchetEnvelope,
}

impl PreKeyEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, OmemoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OmemoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Root-chain step: derive the next root key and a fresh chain key from a
/// DH output.
pub fn kdf_root(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(ROOT_INFO, &mut okm)
        .expect("64 bytes is a valid hkdf-sha256 output length");

    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    (next_root, chain)
}

/// Symmetric-chain step: derive the message key and the next chain key.
pub fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mac = HmacSha256::new_from_slice(chain_key)
        .expect("hmac accepts 32-byte keys");
    mac.update(&[0x02]);
    let next_chain: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = HmacSha256::new_from_slice(chain_key)
        .expect("hmac accepts 32-byte keys");
    mac.update(&[0x01]);
    let message_key: [u8; 32] = mac.finalize().into_bytes().into();

    (next_chain, message_key)
}

/// Expand a message key into AEAD key and IV for the wrapped material.
pub fn message_key_material(message_key: &[u8; 32]) -> ([u8; 16], [u8; 12]) {
    let hk = Hkdf::<Sha256>::new(None, message_key);
    let mut okm = [0u8; 28];
    hk.expand(MESSAGE_INFO, &mut okm)
        .expect("28 bytes is a valid hkdf-sha256 output length");

    let mut key = [0u8; 16];
    let mut iv = [0u8; 12];
    key.copy_from_slice(&okm[..16]);
    iv.copy_from_slice(&okm[16..]);
    (key, iv)
}

/// Associated data binding a message to the session identities and header.
fn message_aad(
    associated_data: &[u8],
    ratchet_key: &[u8; 32],
    previous_counter: u32,
    counter: u32,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(associated_data.len() + 40);
    aad.extend_from_slice(associated_data);
    aad.extend_from_slice(ratchet_key);
    aad.extend_from_slice(&previous_counter.to_be_bytes());
    aad.extend_from_slice(&counter.to_be_bytes());
    aad
}

/// Advance the sending chain one step and wrap `key_material`.
pub fn encrypt_step(
    engine: &dyn CryptoEngine,
    state: &mut SessionState,
    key_material: &[u8],
) -> Result<RatchetEnvelope, OmemoError> {
    let ck = state
        .cks
        .ok_or_else(|| OmemoError::Crypto("session has no sending chain".into()))?;
    let (next_chain, message_key) = kdf_chain(&ck);
    let (key, iv) = message_key_material(&message_key);
    let aad = message_aad(&state.associated_data, &state.dhs_public, state.pn, state.ns);
    let ciphertext = engine.aead_encrypt(&key, &iv, &aad, key_material)?;

    let envelope = RatchetEnvelope {
        ratchet_key: state.dhs_public,
        previous_counter: state.pn,
        counter: state.ns,
        ciphertext,
    };

    state.cks = Some(next_chain);
    state.ns += 1;
    Ok(envelope)
}

/// Process an inbound ratchet message and unwrap its key material.
///
/// Handles out-of-order delivery by deriving and storing up to [`MAX_SKIP`]
/// message keys per chain. Fails with `AuthFailure` on tag mismatch or when
/// the message key was already consumed, and with `SkippedOverflow` when the
/// message lies too far ahead.
pub fn decrypt_step(
    engine: &dyn CryptoEngine,
    state: &mut SessionState,
    envelope: &RatchetEnvelope,
) -> Result<Vec<u8>, OmemoError> {
    let aad = message_aad(
        &state.associated_data,
        &envelope.ratchet_key,
        envelope.previous_counter,
        envelope.counter,
    );

    if let Some(message_key) = state.take_skipped(&envelope.ratchet_key, envelope.counter) {
        let (key, iv) = message_key_material(&message_key);
        return engine.aead_decrypt(&key, &iv, &aad, &envelope.ciphertext);
    }

    if state.dhr != Some(envelope.ratchet_key) {
        skip_message_keys(state, envelope.previous_counter)?;
        dh_ratchet(engine, state, &envelope.ratchet_key)?;
    }

    if envelope.counter < state.nr {
        // Key already consumed and not in the skipped store: a replay.
        return Err(OmemoError::AuthFailure);
    }
    skip_message_keys(state, envelope.counter)?;

    let ck = state
        .ckr
        .ok_or_else(|| OmemoError::Crypto("session has no receiving chain".into()))?;
    let (next_chain, message_key) = kdf_chain(&ck);
    let (key, iv) = message_key_material(&message_key);
    let plaintext = engine.aead_decrypt(&key, &iv, &aad, &envelope.ciphertext)?;

    state.ckr = Some(next_chain);
    state.nr += 1;
    Ok(plaintext)
}

/// Derive and store message keys for indices `nr..until` of the current
/// receiving chain.
fn skip_message_keys(state: &mut SessionState, until: u32) -> Result<(), OmemoError> {
    if until <= state.nr {
        return Ok(());
    }
    if until - state.nr > MAX_SKIP {
        return Err(OmemoError::SkippedOverflow {
            requested: until - state.nr,
            limit: MAX_SKIP,
        });
    }
    let Some(mut ck) = state.ckr else {
        // No receiving chain yet, nothing to put aside.
        return Ok(());
    };
    let Some(ratchet_key) = state.dhr else {
        return Ok(());
    };

    let now = unix_now();
    while state.nr < until {
        let (next_chain, message_key) = kdf_chain(&ck);
        state.skipped.push(SkippedKey {
            ratchet_key,
            counter: state.nr,
            message_key,
            stored_at: now,
        });
        ck = next_chain;
        state.nr += 1;
    }
    state.ckr = Some(ck);

    // Bound the store; the oldest keys are dropped silently.
    let max = MAX_SKIP as usize;
    if state.skipped.len() > max {
        let excess = state.skipped.len() - max;
        state.skipped.drain(..excess);
    }
    Ok(())
}

/// DH ratchet step on receipt of a new remote ratchet key.
fn dh_ratchet(
    engine: &dyn CryptoEngine,
    state: &mut SessionState,
    new_remote: &[u8; 32],
) -> Result<(), OmemoError> {
    let remote = X25519Public::from(*new_remote);

    state.pn = state.ns;
    state.ns = 0;
    state.nr = 0;
    state.dhr = Some(*new_remote);

    let current = state.ratchet_key_pair()?;
    let (root, ckr) = kdf_root(&state.root_key, &engine.agree(current.secret(), &remote));
    state.ckr = Some(ckr);

    let next = engine.generate_pre_key();
    let (root, cks) = kdf_root(&root, &engine.agree(next.secret(), &remote));
    state.root_key = root;
    state.cks = Some(cks);
    state.dhs_secret = next.to_bytes();
    state.dhs_public = next.public().to_bytes();
    Ok(())
}
