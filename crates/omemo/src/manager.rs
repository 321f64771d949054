//! The OMEMO manager: public façade over every engine component.
//!
//! One manager instance serves one `(account, device id)` pair on one
//! connection. All mutable engine state sits behind a single coarse mutex;
//! network operations (bundle fetch, device-list fetch, publishes) never run
//! while it is held. The pattern throughout is: snapshot under the lock,
//! do I/O, re-acquire to commit.
//!
//! Lifecycle is explicit: construct with [`OmemoManager::new`], call
//! [`OmemoManager::initialize`] once the connection is authenticated, and
//! [`OmemoManager::wait_for_background_tasks`] before dropping if
//! deterministic teardown matters.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use rand::Rng;

use chirp_shared::constants::BODY_OMEMO_HINT;
use chirp_shared::element::{BundleElement, DeviceListElement, OmemoElement};
use chirp_shared::{BareJid, DeviceId, OmemoDevice};

use crate::bundles;
use crate::config::OmemoConfig;
use crate::decrypt::{self, DecryptedMessage};
use crate::encrypt;
use crate::engine::CryptoEngine;
use crate::error::OmemoError;
use crate::keys::{IdentityKey, IdentityKeyPair};
use crate::receive::{
    CarbonDirection, MessageInfo, OmemoMessageListener, Provenance, ReceivePipeline,
};
use crate::registry;
use crate::session;
use crate::store::OmemoStore;
use crate::transport::{
    AccessModel, Connection, OutboundMessage, PubSub, RoomInfo, TransportError,
};
use crate::trust::{self, TrustCallback, TrustState};

/// Consecutive corrupted messages from one device before its session is
/// torn down.
const CORRUPTION_RESET_THRESHOLD: u32 = 3;

pub(crate) struct ManagerState {
    pub(crate) store: Box<dyn OmemoStore>,
    pub(crate) own_device: Option<OmemoDevice>,
    identity: Option<IdentityKeyPair>,
    trust_callback: Option<Arc<dyn TrustCallback>>,
    corrupt_counts: HashMap<OmemoDevice, u32>,
    refresh_in_flight: HashSet<BareJid>,
    republish_in_flight: bool,
    last_self_republish: Option<Instant>,
}

pub struct OmemoManager {
    connection: Arc<dyn Connection>,
    pubsub: Arc<dyn PubSub>,
    engine: Arc<dyn CryptoEngine>,
    config: OmemoConfig,
    pipeline: ReceivePipeline,
    state: Mutex<ManagerState>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

fn identity_of(state: &ManagerState) -> Result<IdentityKeyPair, OmemoError> {
    state.identity.clone().ok_or(OmemoError::NotInitialized)
}

fn own_device_of(state: &ManagerState) -> Result<OmemoDevice, OmemoError> {
    state.own_device.clone().ok_or(OmemoError::NotInitialized)
}

impl OmemoManager {
    pub fn new(
        connection: Arc<dyn Connection>,
        pubsub: Arc<dyn PubSub>,
        engine: Arc<dyn CryptoEngine>,
        store: Box<dyn OmemoStore>,
        config: OmemoConfig,
    ) -> Arc<Self> {
        Arc::new(OmemoManager {
            connection,
            pubsub,
            engine,
            config,
            pipeline: ReceivePipeline::new(),
            state: Mutex::new(ManagerState {
                store,
                own_device: None,
                identity: None,
                trust_callback: None,
                corrupt_counts: HashMap::new(),
                refresh_in_flight: HashSet::new(),
                republish_in_flight: false,
                last_self_republish: None,
            }),
            background: Mutex::new(Vec::new()),
        })
    }

    /// A fresh device id, uniformly drawn from the valid range.
    pub fn random_device_id() -> DeviceId {
        let id = rand::thread_rng().gen_range(DeviceId::MIN..=DeviceId::MAX);
        DeviceId::new(id).expect("generated within the valid range")
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().expect("manager state lock")
    }

    fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.background
            .lock()
            .expect("background task list lock")
            .push(std::thread::spawn(task));
    }

    /// Join every background task spawned so far (refreshes, republishes).
    pub fn wait_for_background_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .expect("background task list lock")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Prepare and publish this device's key material and device-list
    /// enrollment. Requires an authenticated connection.
    ///
    /// Idempotent: key material is only generated where missing, and the
    /// device list is only republished when our id is absent from it.
    pub fn initialize(self: &Arc<Self>) -> Result<(), OmemoError> {
        if !self.connection.is_authenticated() {
            return Err(TransportError::NotConnected.into());
        }
        let own_jid = self
            .connection
            .own_jid()
            .ok_or(TransportError::NotConnected)?;

        let (bundle, own_device) = {
            let mut state = self.lock_state();

            let identity = match state.store.load_identity()? {
                Some(identity) => identity,
                None => {
                    let identity = self.engine.generate_identity();
                    state.store.store_identity(&identity)?;
                    tracing::info!("generated identity key pair");
                    identity
                }
            };
            state.identity = Some(identity);

            let own_device = match &state.own_device {
                Some(device) => device.clone(),
                None => {
                    let stored = state.store.local_device_ids(&own_jid)?;
                    let id = stored
                        .first()
                        .copied()
                        .unwrap_or_else(Self::random_device_id);
                    state.store.add_local_device_id(&own_jid, id)?;
                    let device = OmemoDevice::new(own_jid.clone(), id);
                    tracing::info!(device = %device, "assigned device id");
                    state.own_device = Some(device.clone());
                    device
                }
            };

            if bundles::signed_pre_key_is_stale(
                state.store.as_ref(),
                self.config.signed_prekey_max_age_days,
            )? {
                bundles::rotate_signed_pre_key(self.engine.as_ref(), state.store.as_ref())?;
            }
            bundles::prune_signed_pre_keys(
                state.store.as_ref(),
                self.config.signed_prekey_grace_days,
            )?;
            bundles::ensure_pre_key_pool(
                self.engine.as_ref(),
                state.store.as_ref(),
                self.config.prekey_pool_target,
            )?;

            (bundles::build_bundle(state.store.as_ref())?, own_device)
        };

        self.pubsub
            .publish_bundle(own_device.id, &bundle, AccessModel::Open)?;

        let published = self
            .pubsub
            .fetch_device_list(&own_jid, self.config.fetch_timeout())?;

        let enrollment = {
            let state = self.lock_state();
            let mut ids = published.map(|l| l.device_ids).unwrap_or_default();
            let missing = !ids.contains(&own_device.id);
            ids.insert(own_device.id);
            let list = DeviceListElement::new(ids);
            registry::merge_device_list(state.store.as_ref(), &own_jid, &list)?;
            missing.then_some(list)
        };

        if let Some(list) = enrollment {
            self.pubsub.publish_device_list(&list, AccessModel::Open)?;
        }

        tracing::info!(device = %own_device, "omemo manager initialized");
        Ok(())
    }

    /// Install the trust callback. May only happen once per manager.
    pub fn set_trust_callback(&self, callback: Arc<dyn TrustCallback>) -> Result<(), OmemoError> {
        let mut state = self.lock_state();
        if state.trust_callback.is_some() {
            return Err(OmemoError::TrustCallbackAlreadySet);
        }
        state.trust_callback = Some(callback);
        Ok(())
    }

    fn callback(&self) -> Result<Arc<dyn TrustCallback>, OmemoError> {
        self.lock_state()
            .trust_callback
            .clone()
            .ok_or(OmemoError::NoTrustCallback)
    }

    pub fn own_device(&self) -> Result<OmemoDevice, OmemoError> {
        own_device_of(&self.lock_state())
    }

    pub fn add_message_listener(&self, listener: Arc<dyn OmemoMessageListener>) {
        self.pipeline.add_listener(listener);
    }

    /// Unregister a listener added with
    /// [`OmemoManager::add_message_listener`].
    pub fn remove_message_listener(&self, listener: &Arc<dyn OmemoMessageListener>) {
        self.pipeline.remove_listener(listener);
    }

    // -- fingerprints and trust ------------------------------------------

    pub fn own_fingerprint(&self) -> Result<String, OmemoError> {
        let state = self.lock_state();
        let identity = identity_of(&state)?;
        Ok(self.engine.fingerprint(&identity.public()))
    }

    /// Fingerprint of `device`, fetching its bundle if the identity has
    /// never been seen.
    pub fn fingerprint(&self, device: &OmemoDevice) -> Result<String, OmemoError> {
        {
            let state = self.lock_state();
            if state.own_device.as_ref() == Some(device) {
                let identity = identity_of(&state)?;
                return Ok(self.engine.fingerprint(&identity.public()));
            }
            if let Some(fp) =
                trust::fingerprint_of(self.engine.as_ref(), state.store.as_ref(), device)?
            {
                return Ok(fp);
            }
        }

        let bundle = self
            .pubsub
            .fetch_bundle(device, self.config.fetch_timeout())?
            .ok_or_else(|| OmemoError::MissingFingerprint(device.clone()))?;
        let identity = IdentityKey::from_bytes(&bundle.identity_key)?;

        let state = self.lock_state();
        state.store.store_remote_identity(device, &bundle.identity_key)?;
        Ok(self.engine.fingerprint(&identity))
    }

    /// Fingerprints of every active device of `contact` whose identity is
    /// known.
    pub fn active_fingerprints(
        &self,
        contact: &BareJid,
    ) -> Result<Vec<(OmemoDevice, String)>, OmemoError> {
        let state = self.lock_state();
        let mut fingerprints = Vec::new();
        for device in registry::active_devices(state.store.as_ref(), contact)? {
            if let Some(fp) =
                trust::fingerprint_of(self.engine.as_ref(), state.store.as_ref(), &device)?
            {
                fingerprints.push((device, fp));
            }
        }
        Ok(fingerprints)
    }

    pub fn trust_device(&self, device: &OmemoDevice, fingerprint: &str) -> Result<(), OmemoError> {
        self.callback()?
            .set_trust(device, fingerprint, TrustState::Trusted);
        Ok(())
    }

    pub fn distrust_device(
        &self,
        device: &OmemoDevice,
        fingerprint: &str,
    ) -> Result<(), OmemoError> {
        self.callback()?
            .set_trust(device, fingerprint, TrustState::Untrusted);
        Ok(())
    }

    pub fn is_trusted(&self, device: &OmemoDevice, fingerprint: &str) -> Result<bool, OmemoError> {
        Ok(self.callback()?.trust_state(device, fingerprint) == TrustState::Trusted)
    }

    pub fn is_decided(&self, device: &OmemoDevice, fingerprint: &str) -> Result<bool, OmemoError> {
        Ok(self.callback()?.trust_state(device, fingerprint) != TrustState::Undecided)
    }

    // -- device lists ----------------------------------------------------

    /// Last-known active devices of `owner`. Never blocks on the network; a
    /// stale cache triggers a coalesced background refresh.
    pub fn active_devices(
        self: &Arc<Self>,
        owner: &BareJid,
    ) -> Result<Vec<OmemoDevice>, OmemoError> {
        let devices = {
            let state = self.lock_state();
            registry::active_devices(state.store.as_ref(), owner)?
        };
        self.refresh_if_stale(owner);
        Ok(devices)
    }

    /// Synchronously fetch and merge `contact`'s published device list.
    pub fn request_device_list_update(&self, contact: &BareJid) -> Result<(), OmemoError> {
        let fetched = self
            .pubsub
            .fetch_device_list(contact, self.config.fetch_timeout())?;
        let list = fetched.unwrap_or_default();
        let state = self.lock_state();
        registry::merge_device_list(state.store.as_ref(), contact, &list)?;
        Ok(())
    }

    /// Refresh the contact's list and report whether any active device is
    /// announced.
    pub fn contact_supports_omemo(&self, contact: &BareJid) -> Result<bool, OmemoError> {
        self.request_device_list_update(contact)?;
        let state = self.lock_state();
        Ok(!registry::active_devices(state.store.as_ref(), contact)?.is_empty())
    }

    fn refresh_if_stale(self: &Arc<Self>, owner: &BareJid) {
        let should_refresh = {
            let mut state = self.lock_state();
            let stale = registry::is_stale(
                state.store.as_ref(),
                owner,
                self.config.stale_threshold(),
            )
            .unwrap_or(true);
            stale && state.refresh_in_flight.insert(owner.clone())
        };
        if !should_refresh {
            return;
        }

        let manager = Arc::clone(self);
        let owner = owner.clone();
        self.spawn(move || {
            let result = manager
                .pubsub
                .fetch_device_list(&owner, manager.config.fetch_timeout());
            let mut state = manager.lock_state();
            state.refresh_in_flight.remove(&owner);
            match result {
                Ok(fetched) => {
                    let list = fetched.unwrap_or_default();
                    if let Err(e) =
                        registry::merge_device_list(state.store.as_ref(), &owner, &list)
                    {
                        tracing::warn!(owner = %owner, error = %e, "device list merge failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(owner = %owner, error = %e, "device list refresh failed");
                }
            }
        });
    }

    /// Republish our device list off the notification thread. Coalesces
    /// bursts of events: at most one republish per staleness window.
    pub(crate) fn republish_device_list_async(self: &Arc<Self>, list: DeviceListElement) {
        {
            let mut state = self.lock_state();
            if state.republish_in_flight {
                return;
            }
            if let Some(at) = state.last_self_republish {
                if at.elapsed() < self.config.stale_threshold() {
                    return;
                }
            }
            state.republish_in_flight = true;
        }

        let manager = Arc::clone(self);
        self.spawn(move || {
            let result = manager.pubsub.publish_device_list(&list, AccessModel::Open);
            let mut state = manager.lock_state();
            state.republish_in_flight = false;
            match result {
                Ok(()) => {
                    state.last_self_republish = Some(Instant::now());
                    if let Some(own) = state.own_device.clone() {
                        if let Err(e) =
                            registry::merge_device_list(state.store.as_ref(), &own.owner, &list)
                        {
                            tracing::warn!(error = %e, "merging republished list failed");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "device list republish failed"),
            }
        });
    }

    // -- sessions --------------------------------------------------------

    pub fn has_session(&self, device: &OmemoDevice) -> Result<bool, OmemoError> {
        let state = self.lock_state();
        session::has_session(state.store.as_ref(), device)
    }

    /// Delete the session with `device`; the next send re-establishes it.
    pub fn reset_session(&self, device: &OmemoDevice) -> Result<(), OmemoError> {
        let mut state = self.lock_state();
        state.corrupt_counts.remove(device);
        session::reset(state.store.as_ref(), device)
    }

    /// Number of skipped message keys currently held for `device`.
    pub fn skipped_key_count(&self, device: &OmemoDevice) -> Result<usize, OmemoError> {
        let state = self.lock_state();
        session::skipped_key_count(state.store.as_ref(), device)
    }

    /// Drop skipped message keys older than `max_age_secs`.
    pub fn prune_skipped_keys(&self, max_age_secs: u64) -> Result<usize, OmemoError> {
        let state = self.lock_state();
        session::prune_skipped_keys(state.store.as_ref(), max_age_secs)
    }

    /// Eagerly establish sessions with every active device of `contact`.
    pub fn build_sessions_with(&self, contact: &BareJid) -> Result<(), OmemoError> {
        let missing = {
            let state = self.lock_state();
            own_device_of(&state)?;
            let mut missing = Vec::new();
            for device in registry::active_devices(state.store.as_ref(), contact)? {
                if !session::has_session(state.store.as_ref(), &device)? {
                    missing.push(device);
                }
            }
            missing
        };

        let (fetched, mut failures) = self.fetch_bundles(&missing);
        let (successes, establish_failures) = self.establish_from(&fetched);
        failures.extend(establish_failures);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OmemoError::CannotEstablish {
                successes,
                failures,
            })
        }
    }

    /// Fetch bundles for `devices` and record their identities. Returns the
    /// fetched pairs and the devices that yielded nothing.
    fn fetch_bundles(
        &self,
        devices: &[OmemoDevice],
    ) -> (Vec<(OmemoDevice, BundleElement)>, Vec<OmemoDevice>) {
        let mut fetched = Vec::new();
        let mut failures = Vec::new();
        for device in devices {
            match self.pubsub.fetch_bundle(device, self.config.fetch_timeout()) {
                Ok(Some(bundle)) => fetched.push((device.clone(), bundle)),
                Ok(None) => {
                    tracing::warn!(device = %device, "no bundle published");
                    failures.push(device.clone());
                }
                Err(e) => {
                    tracing::warn!(device = %device, error = %e, "bundle fetch failed");
                    failures.push(device.clone());
                }
            }
        }

        if !fetched.is_empty() {
            let state = self.lock_state();
            for (device, bundle) in &fetched {
                if let Err(e) = state.store.store_remote_identity(device, &bundle.identity_key)
                {
                    tracing::warn!(device = %device, error = %e, "storing identity failed");
                }
            }
        }
        (fetched, failures)
    }

    /// Establish sessions from fetched bundles, one transaction each.
    fn establish_from(
        &self,
        fetched: &[(OmemoDevice, BundleElement)],
    ) -> (Vec<OmemoDevice>, Vec<OmemoDevice>) {
        let mut successes = Vec::new();
        let mut failures = Vec::new();

        let state = self.lock_state();
        let identity = match identity_of(&state) {
            Ok(identity) => identity,
            Err(_) => return (successes, fetched.iter().map(|(d, _)| d.clone()).collect()),
        };
        for (device, bundle) in fetched {
            match session::establish_outgoing(
                self.engine.as_ref(),
                state.store.as_ref(),
                &identity,
                device,
                bundle,
            ) {
                Ok(()) => successes.push(device.clone()),
                Err(e) => {
                    tracing::warn!(device = %device, error = %e, "session establishment failed");
                    failures.push(device.clone());
                }
            }
        }
        (successes, failures)
    }

    // -- encryption ------------------------------------------------------

    /// Encrypt `plaintext` for one recipient identity (and our own other
    /// devices).
    pub fn encrypt(
        self: &Arc<Self>,
        recipient: &BareJid,
        plaintext: &[u8],
    ) -> Result<OutboundMessage, OmemoError> {
        self.encrypt_multi(std::slice::from_ref(recipient), plaintext)
    }

    /// Encrypt `plaintext` for several recipient identities at once.
    pub fn encrypt_multi(
        self: &Arc<Self>,
        recipients: &[BareJid],
        plaintext: &[u8],
    ) -> Result<OutboundMessage, OmemoError> {
        let element = self.encrypt_element(recipients, plaintext)?;
        Ok(self.finish_message(element))
    }

    /// Encrypt for a multi-user chat. The room must be members-only and
    /// non-anonymous.
    pub fn encrypt_for_room(
        self: &Arc<Self>,
        room: &RoomInfo,
        plaintext: &[u8],
    ) -> Result<OutboundMessage, OmemoError> {
        if !room.supports_omemo() {
            return Err(OmemoError::NoOmemoSupport);
        }
        self.encrypt_multi(&room.members, plaintext)
    }

    /// Fallback after `CannotEstablish`: encrypt only for devices that
    /// already hold a session.
    pub fn encrypt_for_existing_sessions(
        &self,
        devices: &[OmemoDevice],
        plaintext: &[u8],
    ) -> Result<OutboundMessage, OmemoError> {
        let state = self.lock_state();
        let own_device = own_device_of(&state)?;
        let identity = identity_of(&state)?;
        let callback = state
            .trust_callback
            .clone()
            .ok_or(OmemoError::NoTrustCallback)?;

        let included = trust::gate_devices(
            self.engine.as_ref(),
            state.store.as_ref(),
            callback.as_ref(),
            devices,
        )?;

        let mut ready = Vec::new();
        let mut missing = Vec::new();
        for device in included {
            if session::has_session(state.store.as_ref(), &device)? {
                ready.push(device);
            } else {
                missing.push(device);
            }
        }
        if ready.is_empty() {
            return Err(OmemoError::CannotEstablish {
                successes: Vec::new(),
                failures: missing,
            });
        }

        let element = encrypt::encrypt_message(
            self.engine.as_ref(),
            state.store.as_ref(),
            &identity,
            own_device.id,
            &ready,
            plaintext,
        )?;
        Ok(self.finish_message(element))
    }

    /// Wrap externally supplied key material (e.g. for encrypted file
    /// transfer) for the given devices, without a payload.
    pub fn create_key_transport(
        self: &Arc<Self>,
        devices: &[OmemoDevice],
        key: &[u8],
        iv: &[u8],
    ) -> Result<OmemoElement, OmemoError> {
        let ready = self.prepare_devices(devices.to_vec())?;
        let state = self.lock_state();
        let own_device = own_device_of(&state)?;
        let identity = identity_of(&state)?;
        encrypt::key_transport(
            self.engine.as_ref(),
            state.store.as_ref(),
            &identity,
            own_device.id,
            &ready,
            key,
            iv,
        )
    }

    /// Send an empty key-transport message to advance the ratchet with
    /// `device` on demand.
    pub fn send_ratchet_update(
        self: &Arc<Self>,
        device: &OmemoDevice,
    ) -> Result<(), OmemoError> {
        let key = self.engine.random(chirp_shared::constants::AES_KEY_LENGTH);
        let iv = self.engine.random(chirp_shared::constants::IV_LENGTH);
        let element = self.create_key_transport(std::slice::from_ref(device), &key, &iv)?;

        let message = OutboundMessage {
            element,
            body: None,
            store_hint: self.config.add_mam_storage_hint,
            eme_hint: self.config.add_eme_hint,
        };
        self.connection.send_message(&device.owner, &message)?;
        Ok(())
    }

    /// Gate, fetch and establish until every surviving device has a live
    /// session. Shared by the send paths.
    fn prepare_devices(
        self: &Arc<Self>,
        candidates: Vec<OmemoDevice>,
    ) -> Result<Vec<OmemoDevice>, OmemoError> {
        let callback = self.callback()?;

        let need_bundle = {
            let state = self.lock_state();
            let mut need = Vec::new();
            for device in &candidates {
                if !session::has_session(state.store.as_ref(), device)? {
                    need.push(device.clone());
                }
            }
            need
        };

        // Identities are learned from the fetched bundles, so brand-new
        // devices have a fingerprint to gate on. No session exists yet at
        // this point.
        let (fetched, mut failures) = self.fetch_bundles(&need_bundle);

        let included = {
            let state = self.lock_state();
            let gate_input: Vec<OmemoDevice> = candidates
                .iter()
                .filter(|d| !failures.contains(d))
                .cloned()
                .collect();
            trust::gate_devices(
                self.engine.as_ref(),
                state.store.as_ref(),
                callback.as_ref(),
                &gate_input,
            )?
        };

        let to_establish: Vec<(OmemoDevice, BundleElement)> = fetched
            .into_iter()
            .filter(|(d, _)| included.contains(d))
            .collect();
        let (_, establish_failures) = self.establish_from(&to_establish);
        failures.extend(establish_failures);

        let successes: Vec<OmemoDevice> = {
            let state = self.lock_state();
            let mut successes = Vec::new();
            for device in included {
                if session::has_session(state.store.as_ref(), &device)? {
                    successes.push(device);
                }
            }
            successes
        };

        if !failures.is_empty() {
            return Err(OmemoError::CannotEstablish {
                successes,
                failures,
            });
        }
        if successes.is_empty() {
            return Err(OmemoError::CannotEstablish {
                successes: Vec::new(),
                failures: Vec::new(),
            });
        }
        Ok(successes)
    }

    fn encrypt_element(
        self: &Arc<Self>,
        recipients: &[BareJid],
        plaintext: &[u8],
    ) -> Result<OmemoElement, OmemoError> {
        let (own_device, owners, unknown_owners) = {
            let state = self.lock_state();
            let own_device = own_device_of(&state)?;

            let mut owners: Vec<BareJid> = Vec::new();
            for jid in recipients.iter().chain(std::iter::once(&own_device.owner)) {
                if !owners.contains(jid) {
                    owners.push(jid.clone());
                }
            }
            let mut unknown = Vec::new();
            for owner in &owners {
                if state.store.load_device_list(owner)?.is_none() {
                    unknown.push(owner.clone());
                }
            }
            (own_device, owners, unknown)
        };

        // First contact with an owner blocks on its published list; stale
        // cached lists only trigger a background refresh.
        for owner in &unknown_owners {
            let fetched = self
                .pubsub
                .fetch_device_list(owner, self.config.fetch_timeout())?;
            let list = fetched.unwrap_or_default();
            let state = self.lock_state();
            registry::merge_device_list(state.store.as_ref(), owner, &list)?;
        }
        for owner in &owners {
            self.refresh_if_stale(owner);
        }

        let candidates = {
            let state = self.lock_state();
            let mut candidates = Vec::new();
            for owner in &owners {
                for device in registry::active_devices(state.store.as_ref(), owner)? {
                    if device != own_device && !candidates.contains(&device) {
                        candidates.push(device);
                    }
                }
            }
            candidates
        };

        let ready = self.prepare_devices(candidates)?;

        let state = self.lock_state();
        let identity = identity_of(&state)?;
        encrypt::encrypt_message(
            self.engine.as_ref(),
            state.store.as_ref(),
            &identity,
            own_device.id,
            &ready,
            plaintext,
        )
    }

    fn finish_message(&self, element: OmemoElement) -> OutboundMessage {
        OutboundMessage {
            element,
            body: self
                .config
                .add_omemo_hint_body
                .then(|| BODY_OMEMO_HINT.to_string()),
            store_hint: self.config.add_mam_storage_hint,
            eme_hint: self.config.add_eme_hint,
        }
    }

    // -- signed pre-key rotation -----------------------------------------

    /// Rotate the signed pre-key, prune expired generations and republish
    /// the bundle.
    pub fn rotate_signed_pre_key(&self) -> Result<(), OmemoError> {
        let (bundle, own_device) = {
            let state = self.lock_state();
            let own_device = own_device_of(&state)?;
            bundles::rotate_signed_pre_key(self.engine.as_ref(), state.store.as_ref())?;
            bundles::prune_signed_pre_keys(
                state.store.as_ref(),
                self.config.signed_prekey_grace_days,
            )?;
            (bundles::build_bundle(state.store.as_ref())?, own_device)
        };
        self.pubsub
            .publish_bundle(own_device.id, &bundle, AccessModel::Open)?;
        Ok(())
    }

    // -- receive paths ---------------------------------------------------

    /// Decrypt a directly received message element.
    ///
    /// Returns `Ok(None)` when the element carries no key for this device.
    pub fn receive_message(
        self: &Arc<Self>,
        from: &BareJid,
        element: &OmemoElement,
    ) -> Result<Option<DecryptedMessage>, OmemoError> {
        self.process_inbound(from, element, Provenance::Direct)
    }

    /// Decrypt a carbon-copied element. For `Sent` carbons the sender JID
    /// is our own account (the copy mirrors another of our devices).
    pub fn receive_carbon(
        self: &Arc<Self>,
        direction: CarbonDirection,
        from: &BareJid,
        element: &OmemoElement,
    ) -> Result<Option<DecryptedMessage>, OmemoError> {
        self.process_inbound(from, element, Provenance::Carbon(direction))
    }

    /// Decrypt one element replayed from the archive. Never triggers
    /// re-publication side effects.
    pub fn decrypt_archived(
        self: &Arc<Self>,
        from: &BareJid,
        element: &OmemoElement,
    ) -> Result<Option<DecryptedMessage>, OmemoError> {
        self.process_inbound(from, element, Provenance::Archive)
    }

    /// Decrypt a batch of archived elements, skipping what cannot be
    /// decrypted.
    pub fn decrypt_archive_batch(
        self: &Arc<Self>,
        batch: &[(BareJid, OmemoElement)],
    ) -> Vec<DecryptedMessage> {
        let mut decrypted = Vec::new();
        for (from, element) in batch {
            match self.decrypt_archived(from, element) {
                Ok(Some(message)) => decrypted.push(message),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(from = %from, error = %e, "archived message skipped");
                }
            }
        }
        decrypted
    }

    fn process_inbound(
        self: &Arc<Self>,
        sender_jid: &BareJid,
        element: &OmemoElement,
        provenance: Provenance,
    ) -> Result<Option<DecryptedMessage>, OmemoError> {
        let (message, info) = {
            let mut state = self.lock_state();
            let own_device = own_device_of(&state)?;
            if element.key_for(own_device.id).is_none() {
                tracing::debug!(sender = %sender_jid, "element not addressed to this device");
                return Ok(None);
            }
            let identity = identity_of(&state)?;
            let sender = OmemoDevice::new(sender_jid.clone(), element.sid);

            match decrypt::decrypt_element(
                self.engine.as_ref(),
                state.store.as_ref(),
                &identity,
                own_device.id,
                sender_jid,
                element,
            ) {
                Ok(message) => {
                    state.corrupt_counts.remove(&sender);
                    let fingerprint = trust::fingerprint_of(
                        self.engine.as_ref(),
                        state.store.as_ref(),
                        &sender,
                    )?
                    .ok_or_else(|| OmemoError::MissingFingerprint(sender.clone()))?;
                    let info = MessageInfo::new(sender, fingerprint, provenance);
                    (message, info)
                }
                Err(OmemoError::Corrupted { device, detail }) => {
                    let count = state.corrupt_counts.entry(device.clone()).or_insert(0);
                    *count += 1;
                    tracing::warn!(
                        device = %device,
                        strike = *count,
                        detail = %detail,
                        "corrupted message"
                    );
                    if *count >= CORRUPTION_RESET_THRESHOLD {
                        state.corrupt_counts.remove(&device);
                        session::reset(state.store.as_ref(), &device)?;
                    }
                    return Err(OmemoError::Corrupted { device, detail });
                }
                Err(e) => return Err(e),
            }
        };

        self.pipeline.dispatch(&message, &info);

        // Pre-key consumption may have drained the pool; archives replay
        // old traffic and must not cause publishes.
        if provenance != Provenance::Archive {
            self.replenish_if_low();
        }
        Ok(Some(message))
    }

    fn replenish_if_low(self: &Arc<Self>) {
        let needed = {
            let state = self.lock_state();
            bundles::needs_replenishment(state.store.as_ref(), self.config.prekey_pool_low_water)
                .unwrap_or(false)
        };
        if !needed {
            return;
        }

        let manager = Arc::clone(self);
        self.spawn(move || {
            let rebuilt = {
                let state = manager.lock_state();
                let result = bundles::ensure_pre_key_pool(
                    manager.engine.as_ref(),
                    state.store.as_ref(),
                    manager.config.prekey_pool_target,
                )
                .and_then(|_| bundles::build_bundle(state.store.as_ref()));
                match (result, own_device_of(&state)) {
                    (Ok(bundle), Ok(own)) => Some((bundle, own)),
                    (Err(e), _) => {
                        tracing::warn!(error = %e, "pre-key replenishment failed");
                        None
                    }
                    (_, Err(e)) => {
                        tracing::warn!(error = %e, "pre-key replenishment failed");
                        None
                    }
                }
            };
            if let Some((bundle, own)) = rebuilt {
                if let Err(e) =
                    manager
                        .pubsub
                        .publish_bundle(own.id, &bundle, AccessModel::Open)
                {
                    tracing::warn!(error = %e, "bundle republish failed");
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::engine::AxolotlEngine;
    use crate::store::init_test_db;
    use crate::testing::{AccountTransport, MapTrustCallback, MemoryServer};

    pub struct TestHarness {
        pub manager: Arc<OmemoManager>,
        pub server: Arc<MemoryServer>,
        pub transport: Arc<AccountTransport>,
        pub trust: Arc<MapTrustCallback>,
    }

    impl TestHarness {
        /// A manager wired to a fresh in-memory server, not yet initialized.
        pub fn new(jid: &str, device_id: u32) -> Self {
            Self::on_server(MemoryServer::new(), jid, device_id)
        }

        /// A manager sharing `server` with other harnesses.
        pub fn on_server(server: Arc<MemoryServer>, jid: &str, device_id: u32) -> Self {
            let account = BareJid::new(jid).unwrap();
            let transport = AccountTransport::new(server.clone(), account.clone());
            let store = init_test_db();
            store
                .add_local_device_id(&account, DeviceId::new(device_id).unwrap())
                .unwrap();

            let manager = OmemoManager::new(
                transport.clone(),
                transport.clone(),
                Arc::new(AxolotlEngine::new()),
                Box::new(store),
                OmemoConfig::default(),
            );
            let trust = MapTrustCallback::new();
            manager.set_trust_callback(trust.clone()).unwrap();

            TestHarness {
                manager,
                server,
                transport,
                trust,
            }
        }

        pub fn initialized(jid: &str, device_id: u32) -> Self {
            let harness = Self::new(jid, device_id);
            harness.manager.initialize().unwrap();
            harness
        }

        pub fn initialized_on(server: Arc<MemoryServer>, jid: &str, device_id: u32) -> Self {
            let harness = Self::on_server(server, jid, device_id);
            harness.manager.initialize().unwrap();
            harness
        }

        /// Mark this harness's own fingerprint trusted in `other`'s
        /// callback, as a user would after comparing fingerprints.
        pub fn trusted_by(&self, other: &TestHarness) {
            let fp = self.manager.own_fingerprint().unwrap();
            other.trust.trust_fingerprint(&fp);
        }
    }
}
