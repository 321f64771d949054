//! In-memory transport and trust doubles.
//!
//! A [`MemoryServer`] plays the part of the XMPP service: it holds published
//! device lists and bundles and routes nothing. Each account gets an
//! [`AccountTransport`] facade implementing both [`Connection`] and
//! [`PubSub`] against the shared server, which is enough to drive two
//! managers against each other in tests without any network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chirp_shared::element::{BundleElement, DeviceListElement, OmemoElement};
use chirp_shared::{BareJid, DeviceId, OmemoDevice};

use crate::transport::{
    AccessModel, Connection, OutboundMessage, PubSub, TransportError,
};
use crate::trust::{TrustCallback, TrustState};

/// Shared in-memory stand-in for the server side of PEP and messaging.
#[derive(Default)]
pub struct MemoryServer {
    device_lists: Mutex<HashMap<BareJid, DeviceListElement>>,
    bundles: Mutex<HashMap<OmemoDevice, BundleElement>>,
    device_list_publishes: AtomicUsize,
    bundle_publishes: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the service becoming unreachable; fetches and publishes
    /// fail with `NoResponse` until restored.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(TransportError::NoResponse)
        } else {
            Ok(())
        }
    }

    /// Directly seed a published device list, as another client would.
    pub fn put_device_list(&self, owner: &BareJid, list: DeviceListElement) {
        self.device_lists
            .lock()
            .unwrap()
            .insert(owner.clone(), list);
    }

    /// Drop a published bundle, simulating retraction.
    pub fn remove_bundle(&self, device: &OmemoDevice) {
        self.bundles.lock().unwrap().remove(device);
    }

    pub fn stored_device_list(&self, owner: &BareJid) -> Option<DeviceListElement> {
        self.device_lists.lock().unwrap().get(owner).cloned()
    }

    pub fn stored_bundle(&self, device: &OmemoDevice) -> Option<BundleElement> {
        self.bundles.lock().unwrap().get(device).cloned()
    }

    /// How many device-list publishes the server has seen.
    pub fn device_list_publishes(&self) -> usize {
        self.device_list_publishes.load(Ordering::SeqCst)
    }

    pub fn bundle_publishes(&self) -> usize {
        self.bundle_publishes.load(Ordering::SeqCst)
    }
}

/// Per-account transport facade over a [`MemoryServer`].
pub struct AccountTransport {
    server: Arc<MemoryServer>,
    account: BareJid,
    authenticated: AtomicBool,
    sent: Mutex<Vec<(BareJid, OutboundMessage)>>,
}

impl AccountTransport {
    pub fn new(server: Arc<MemoryServer>, account: BareJid) -> Arc<Self> {
        Arc::new(AccountTransport {
            server,
            account,
            authenticated: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    /// Messages sent through this connection, in order.
    pub fn sent_messages(&self) -> Vec<(BareJid, OutboundMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<(BareJid, OutboundMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Convenience: the OMEMO elements of all sent messages.
    pub fn sent_elements(&self) -> Vec<OmemoElement> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.element.clone())
            .collect()
    }
}

impl Connection for AccountTransport {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn own_jid(&self) -> Option<BareJid> {
        Some(self.account.clone())
    }

    fn send_message(
        &self,
        to: &BareJid,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        if !self.is_authenticated() {
            return Err(TransportError::NotConnected);
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.clone(), message.clone()));
        Ok(())
    }
}

impl PubSub for AccountTransport {
    fn publish_device_list(
        &self,
        list: &DeviceListElement,
        _access: AccessModel,
    ) -> Result<(), TransportError> {
        self.server.check_online()?;
        self.server
            .device_lists
            .lock()
            .unwrap()
            .insert(self.account.clone(), list.clone());
        self.server
            .device_list_publishes
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fetch_device_list(
        &self,
        owner: &BareJid,
        _timeout: Duration,
    ) -> Result<Option<DeviceListElement>, TransportError> {
        self.server.check_online()?;
        Ok(self.server.device_lists.lock().unwrap().get(owner).cloned())
    }

    fn publish_bundle(
        &self,
        device_id: DeviceId,
        bundle: &BundleElement,
        _access: AccessModel,
    ) -> Result<(), TransportError> {
        self.server.check_online()?;
        let device = OmemoDevice::new(self.account.clone(), device_id);
        self.server.bundles.lock().unwrap().insert(device, bundle.clone());
        self.server.bundle_publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fetch_bundle(
        &self,
        device: &OmemoDevice,
        _timeout: Duration,
    ) -> Result<Option<BundleElement>, TransportError> {
        self.server.check_online()?;
        Ok(self.server.bundles.lock().unwrap().get(device).cloned())
    }
}

/// Map-backed trust callback: explicit verdicts per fingerprint, everything
/// else undecided.
#[derive(Default)]
pub struct MapTrustCallback {
    verdicts: Mutex<HashMap<String, TrustState>>,
}

impl MapTrustCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trust_fingerprint(&self, fingerprint: &str) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(fingerprint.to_string(), TrustState::Trusted);
    }

    pub fn distrust_fingerprint(&self, fingerprint: &str) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(fingerprint.to_string(), TrustState::Untrusted);
    }
}

impl TrustCallback for MapTrustCallback {
    fn trust_state(&self, _device: &OmemoDevice, fingerprint: &str) -> TrustState {
        *self
            .verdicts
            .lock()
            .unwrap()
            .get(fingerprint)
            .unwrap_or(&TrustState::Undecided)
    }

    fn set_trust(&self, _device: &OmemoDevice, fingerprint: &str, state: TrustState) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(fingerprint.to_string(), state);
    }
}
