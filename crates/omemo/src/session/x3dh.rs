//! X3DH initial key agreement.
//!
//! Bootstraps a Double-Ratchet session from published bundle material. The
//! initiator combines four agreements (identity-signed, ephemeral-identity,
//! ephemeral-signed, ephemeral-one-time); the responder mirrors them from
//! the pre-key prelude. The responder's signed pre-key doubles as its first
//! ratchet key.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519Public;

use crate::engine::CryptoEngine;
use crate::error::OmemoError;
use crate::keys::{IdentityKey, IdentityKeyPair};
use crate::session::ratchet::{kdf_root, PreKeyEnvelope};
use crate::session::state::{PendingPreKey, SessionState, SessionStatus};
use crate::store::{PreKeyRecord, SignedPreKeyRecord};

const X3DH_INFO: &[u8] = b"OMEMO X3DH";

/// Combine DH outputs into the session's first root key.
fn derive_shared(dh_outputs: &[[u8; 32]]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(32 * (dh_outputs.len() + 1));
    // Discontinuity prefix, keeping the KDF input domain-separated from
    // raw DH output.
    ikm.extend_from_slice(&[0xFFu8; 32]);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut secret = [0u8; 32];
    hk.expand(X3DH_INFO, &mut secret)
        .expect("32 bytes is a valid hkdf-sha256 output length");
    secret
}

fn associated_data(initiator: &IdentityKey, responder: &IdentityKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(&initiator.to_bytes());
    ad.extend_from_slice(&responder.to_bytes());
    ad
}

/// Initiator side: derive a session from a peer's bundle material.
///
/// The signed pre-key signature must be verified by the caller before this
/// runs. The returned session carries the pre-key prelude in `pending`.
#[allow(clippy::too_many_arguments)]
pub fn initiate(
    engine: &dyn CryptoEngine,
    our_identity: &IdentityKeyPair,
    peer_identity: &IdentityKey,
    signed_pre_key_id: u32,
    signed_pre_key: X25519Public,
    pre_key_id: u32,
    one_time_pre_key: X25519Public,
) -> Result<SessionState, OmemoError> {
    let base = engine.generate_pre_key();

    let dh1 = engine.agree(&our_identity.dh_secret(), &signed_pre_key);
    let dh2 = engine.agree(base.secret(), &peer_identity.dh_public());
    let dh3 = engine.agree(base.secret(), &signed_pre_key);
    let dh4 = engine.agree(base.secret(), &one_time_pre_key);
    let shared = derive_shared(&[dh1, dh2, dh3, dh4]);

    // First DH-ratchet half-step against the responder's signed pre-key.
    let ratchet = engine.generate_pre_key();
    let (root_key, cks) = kdf_root(&shared, &engine.agree(ratchet.secret(), &signed_pre_key));

    Ok(SessionState {
        status: SessionStatus::PendingX3dh,
        remote_identity: peer_identity.to_bytes(),
        root_key,
        dhs_secret: ratchet.to_bytes(),
        dhs_public: ratchet.public().to_bytes(),
        dhr: Some(signed_pre_key.to_bytes()),
        cks: Some(cks),
        ns: 0,
        ckr: None,
        nr: 0,
        pn: 0,
        pending: Some(PendingPreKey {
            pre_key_id,
            signed_pre_key_id,
            base_key: base.public().to_bytes(),
        }),
        alice_base_key: None,
        skipped: Vec::new(),
        associated_data: associated_data(&our_identity.public(), peer_identity),
    })
}

/// Responder side: mirror the agreement from a pre-key prelude.
///
/// The produced session has no chains yet; processing the prelude's inner
/// ratchet message establishes the receiving chain.
pub fn respond(
    engine: &dyn CryptoEngine,
    our_identity: &IdentityKeyPair,
    signed_pre_key: &SignedPreKeyRecord,
    one_time_pre_key: &PreKeyRecord,
    envelope: &PreKeyEnvelope,
) -> Result<SessionState, OmemoError> {
    let peer_identity = IdentityKey::from_bytes(&envelope.identity_key)?;
    let base = X25519Public::from(envelope.base_key);
    let spk_pair = signed_pre_key.key_pair()?;
    let otpk_pair = one_time_pre_key.key_pair()?;

    let dh1 = engine.agree(spk_pair.secret(), &peer_identity.dh_public());
    let dh2 = engine.agree(&our_identity.dh_secret(), &base);
    let dh3 = engine.agree(spk_pair.secret(), &base);
    let dh4 = engine.agree(otpk_pair.secret(), &base);
    let shared = derive_shared(&[dh1, dh2, dh3, dh4]);

    Ok(SessionState {
        status: SessionStatus::PendingX3dh,
        remote_identity: peer_identity.to_bytes(),
        root_key: shared,
        dhs_secret: spk_pair.to_bytes(),
        dhs_public: spk_pair.public().to_bytes(),
        dhr: None,
        cks: None,
        ns: 0,
        ckr: None,
        nr: 0,
        pn: 0,
        pending: None,
        alice_base_key: Some(envelope.base_key),
        skipped: Vec::new(),
        associated_data: associated_data(&peer_identity, &our_identity.public()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AxolotlEngine;
    use crate::session::ratchet::{decrypt_step, encrypt_step, RatchetEnvelope};

    struct Responder {
        identity: IdentityKeyPair,
        signed_pre_key: SignedPreKeyRecord,
        one_time_pre_key: PreKeyRecord,
    }

    fn responder(engine: &AxolotlEngine) -> Responder {
        let identity = engine.generate_identity();
        let spk_pair = engine.generate_pre_key();
        let signature = engine.sign(&identity, &spk_pair.public().to_bytes());
        Responder {
            identity,
            signed_pre_key: SignedPreKeyRecord {
                id: 1,
                secret: spk_pair.to_bytes(),
                public: spk_pair.public().to_bytes(),
                signature,
                created_at: 0,
            },
            one_time_pre_key: PreKeyRecord::new(12, &engine.generate_pre_key()),
        }
    }

    fn initiate_against(
        engine: &AxolotlEngine,
        alice: &IdentityKeyPair,
        bob: &Responder,
    ) -> SessionState {
        initiate(
            engine,
            alice,
            &bob.identity.public(),
            bob.signed_pre_key.id,
            spk_public(bob),
            bob.one_time_pre_key.id,
            X25519Public::from(bob.one_time_pre_key.public),
        )
        .unwrap()
    }

    fn spk_public(bob: &Responder) -> X25519Public {
        X25519Public::from(bob.signed_pre_key.public)
    }

    fn prelude(alice_identity: &IdentityKeyPair, session: &SessionState, message: RatchetEnvelope) -> PreKeyEnvelope {
        let pending = session.pending.clone().unwrap();
        PreKeyEnvelope {
            identity_key: alice_identity.public().to_bytes(),
            base_key: pending.base_key,
            signed_pre_key_id: pending.signed_pre_key_id,
            pre_key_id: pending.pre_key_id,
            message,
        }
    }

    #[test]
    fn both_sides_derive_a_working_session() {
        let engine = AxolotlEngine::new();
        let alice_identity = engine.generate_identity();
        let bob = responder(&engine);

        let mut alice = initiate_against(&engine, &alice_identity, &bob);
        let message = encrypt_step(&engine, &mut alice, b"key material").unwrap();
        let envelope = prelude(&alice_identity, &alice, message);

        let mut bob_session = respond(
            &engine,
            &bob.identity,
            &bob.signed_pre_key,
            &bob.one_time_pre_key,
            &envelope,
        )
        .unwrap();

        let out = decrypt_step(&engine, &mut bob_session, &envelope.message).unwrap();
        assert_eq!(out, b"key material");
    }

    #[test]
    fn responder_can_reply_over_the_same_session() {
        let engine = AxolotlEngine::new();
        let alice_identity = engine.generate_identity();
        let bob = responder(&engine);

        let mut alice = initiate_against(&engine, &alice_identity, &bob);
        let m1 = encrypt_step(&engine, &mut alice, b"hello bob").unwrap();
        let envelope = prelude(&alice_identity, &alice, m1);

        let mut bob_session = respond(
            &engine,
            &bob.identity,
            &bob.signed_pre_key,
            &bob.one_time_pre_key,
            &envelope,
        )
        .unwrap();
        decrypt_step(&engine, &mut bob_session, &envelope.message).unwrap();

        let reply = encrypt_step(&engine, &mut bob_session, b"hello alice").unwrap();
        assert_eq!(decrypt_step(&engine, &mut alice, &reply).unwrap(), b"hello alice");
    }

    #[test]
    fn sessions_record_role_ordered_associated_data() {
        let engine = AxolotlEngine::new();
        let alice_identity = engine.generate_identity();
        let bob = responder(&engine);

        let mut alice = initiate_against(&engine, &alice_identity, &bob);
        let message = encrypt_step(&engine, &mut alice, b"x").unwrap();
        let envelope = prelude(&alice_identity, &alice, message);

        let bob_session = respond(
            &engine,
            &bob.identity,
            &bob.signed_pre_key,
            &bob.one_time_pre_key,
            &envelope,
        )
        .unwrap();

        assert_eq!(alice.associated_data, bob_session.associated_data);
        assert_eq!(
            &alice.associated_data[..32],
            alice_identity.public().to_bytes().as_slice()
        );
    }

    #[test]
    fn initiator_session_carries_the_prelude() {
        let engine = AxolotlEngine::new();
        let alice_identity = engine.generate_identity();
        let bob = responder(&engine);

        let alice = initiate_against(&engine, &alice_identity, &bob);
        let pending = alice.pending.clone().unwrap();
        assert_eq!(pending.pre_key_id, 12);
        assert_eq!(pending.signed_pre_key_id, 1);
        assert_eq!(alice.status, SessionStatus::PendingX3dh);
    }

    #[test]
    fn wrong_one_time_pre_key_breaks_the_agreement() {
        let engine = AxolotlEngine::new();
        let alice_identity = engine.generate_identity();
        let bob = responder(&engine);

        let mut alice = initiate_against(&engine, &alice_identity, &bob);
        let message = encrypt_step(&engine, &mut alice, b"x").unwrap();
        let envelope = prelude(&alice_identity, &alice, message);

        let wrong_otpk = PreKeyRecord::new(12, &engine.generate_pre_key());
        let mut bob_session = respond(
            &engine,
            &bob.identity,
            &bob.signed_pre_key,
            &wrong_otpk,
            &envelope,
        )
        .unwrap();

        assert!(decrypt_step(&engine, &mut bob_session, &envelope.message).is_err());
    }
}
