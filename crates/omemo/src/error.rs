//! Error types for the chirp-omemo crate.

use chirp_shared::OmemoDevice;

use crate::transport::TransportError;

/// Errors surfaced by the OMEMO engine.
#[derive(Debug, thiserror::Error)]
pub enum OmemoError {
    /// The manager has not been initialized (no identity or device id yet).
    #[error("omemo manager not initialized")]
    NotInitialized,

    /// No trust callback has been installed.
    #[error("no trust callback set")]
    NoTrustCallback,

    /// A trust callback was already installed; it can only be set once.
    #[error("trust callback already set")]
    TrustCallbackAlreadySet,

    /// Stored key material could not be loaded or parsed.
    #[error("corrupted key material: {0}")]
    CorruptedKey(String),

    /// No identity key is known for the device, so no fingerprint exists.
    #[error("no fingerprint known for device {0}")]
    MissingFingerprint(OmemoDevice),

    /// One or more candidate devices have an undecided trust state. The send
    /// was aborted before any ciphertext was produced.
    #[error("undecided trust for {} device(s)", .0.len())]
    UndecidedDevices(Vec<OmemoDevice>),

    /// The peer device has not published a bundle.
    #[error("no bundle published for device {0}")]
    NoBundle(OmemoDevice),

    /// The signed pre-key signature in a fetched bundle did not verify.
    #[error("bad signed pre-key signature in bundle of {0}")]
    BadSignature(OmemoDevice),

    /// Session establishment failed for a subset of the recipient devices.
    /// The send may be retried against `successes` only.
    #[error("could not establish sessions with {} device(s)", failures.len())]
    CannotEstablish {
        successes: Vec<OmemoDevice>,
        failures: Vec<OmemoDevice>,
    },

    /// No session exists for the sending device and none could be derived
    /// from the message.
    #[error("no session with device {0}")]
    NoSession(OmemoDevice),

    /// The inbound element carries no key addressed to this device.
    #[error("message is not addressed to this device")]
    NotForUs,

    /// Authentication failed while unwrapping or decrypting.
    #[error("message authentication failed")]
    AuthFailure,

    /// The ratchet would have to skip more than the allowed number of
    /// message keys; the message is undecryptable.
    #[error("message would skip {requested} keys (limit {limit})")]
    SkippedOverflow { requested: u32, limit: u32 },

    /// The message or the session state it addresses is corrupted.
    #[error("corrupted message from {device}: {detail}")]
    Corrupted { device: OmemoDevice, detail: String },

    /// The group chat does not meet the requirements for OMEMO
    /// (members-only and non-anonymous).
    #[error("room does not support omemo")]
    NoOmemoSupport,

    /// Failure in a cryptographic primitive.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Persistent storage failure.
    #[error("storage error: {0}")]
    Store(String),

    /// Record serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transient transport failure; the caller may retry.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<rusqlite::Error> for OmemoError {
    fn from(err: rusqlite::Error) -> Self {
        OmemoError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for OmemoError {
    fn from(err: serde_json::Error) -> Self {
        OmemoError::Serialization(err.to_string())
    }
}
