//! Trust state and the send-path trust gate.
//!
//! Trust decisions belong to the user; the engine only resolves fingerprints
//! and enforces the policy: trusted devices are encrypted to, untrusted
//! devices are skipped silently, and any undecided device aborts the whole
//! send before ciphertext exists. A device whose fingerprint has never been
//! seen counts as undecided.

use chirp_shared::OmemoDevice;

use crate::engine::CryptoEngine;
use crate::error::OmemoError;
use crate::keys::IdentityKey;
use crate::store::OmemoStore;

/// Trust verdict for one `(device, fingerprint)` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    /// Never decided by the user; blocks sending.
    Undecided,
    Trusted,
    Untrusted,
}

/// User-side oracle for trust decisions, typically backed by a UI.
///
/// Installed once per manager; replacing it is an error.
pub trait TrustCallback: Send + Sync {
    fn trust_state(&self, device: &OmemoDevice, fingerprint: &str) -> TrustState;

    fn set_trust(&self, device: &OmemoDevice, fingerprint: &str, state: TrustState);
}

/// Resolve the stored fingerprint of `device`, if its identity is known.
pub fn fingerprint_of(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    device: &OmemoDevice,
) -> Result<Option<String>, OmemoError> {
    match store.remote_identity(device)? {
        None => Ok(None),
        Some(bytes) => {
            let identity = IdentityKey::from_bytes(&bytes)?;
            Ok(Some(engine.fingerprint(&identity)))
        }
    }
}

/// Filter `candidates` by trust state.
///
/// Returns the trusted subset. Untrusted devices are dropped silently; if
/// any device is undecided (including devices with no known fingerprint)
/// the whole call fails with `UndecidedDevices` listing them all.
pub fn gate_devices(
    engine: &dyn CryptoEngine,
    store: &dyn OmemoStore,
    callback: &dyn TrustCallback,
    candidates: &[OmemoDevice],
) -> Result<Vec<OmemoDevice>, OmemoError> {
    let mut included = Vec::with_capacity(candidates.len());
    let mut undecided = Vec::new();

    for device in candidates {
        match fingerprint_of(engine, store, device)? {
            None => undecided.push(device.clone()),
            Some(fingerprint) => match callback.trust_state(device, &fingerprint) {
                TrustState::Trusted => included.push(device.clone()),
                TrustState::Untrusted => {
                    tracing::debug!(device = %device, "skipping untrusted device");
                }
                TrustState::Undecided => undecided.push(device.clone()),
            },
        }
    }

    if !undecided.is_empty() {
        return Err(OmemoError::UndecidedDevices(undecided));
    }
    Ok(included)
}
