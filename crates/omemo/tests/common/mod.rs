//! Shared helpers: a full client (manager + in-memory transport) per
//! account/device, all talking to one shared in-memory server.

use std::sync::Arc;

use chirp_omemo::engine::AxolotlEngine;
use chirp_omemo::manager::OmemoManager;
use chirp_omemo::store::{init_test_db, OmemoStore};
use chirp_omemo::testing::{AccountTransport, MapTrustCallback, MemoryServer};
use chirp_omemo::{BareJid, DeviceId, OmemoConfig, OmemoDevice};

pub struct Client {
    pub manager: Arc<OmemoManager>,
    pub transport: Arc<AccountTransport>,
    pub trust: Arc<MapTrustCallback>,
    pub device: OmemoDevice,
}

pub fn jid(s: &str) -> BareJid {
    BareJid::new(s).unwrap()
}

pub fn did(id: u32) -> DeviceId {
    DeviceId::new(id).unwrap()
}

/// Bring up an initialized client for `account` with a fixed device id.
pub fn client(server: &Arc<MemoryServer>, account: &str, device_id: u32) -> Client {
    client_with_config(server, account, device_id, OmemoConfig::default())
}

/// Same as [`client`], with explicit engine configuration.
pub fn client_with_config(
    server: &Arc<MemoryServer>,
    account: &str,
    device_id: u32,
    config: OmemoConfig,
) -> Client {
    let account = jid(account);
    let transport = AccountTransport::new(server.clone(), account.clone());
    let store = init_test_db();
    store
        .add_local_device_id(&account, did(device_id))
        .unwrap();

    let manager = OmemoManager::new(
        transport.clone(),
        transport.clone(),
        Arc::new(AxolotlEngine::new()),
        Box::new(store),
        config,
    );
    let trust = MapTrustCallback::new();
    manager.set_trust_callback(trust.clone()).unwrap();
    manager.initialize().unwrap();

    Client {
        manager,
        transport,
        trust,
        device: OmemoDevice::new(account, did(device_id)),
    }
}

/// Record mutual trust between two clients, as users would after comparing
/// fingerprints out of band.
pub fn trust_each_other(a: &Client, b: &Client) {
    a.trust
        .trust_fingerprint(&b.manager.own_fingerprint().unwrap());
    b.trust
        .trust_fingerprint(&a.manager.own_fingerprint().unwrap());
}

/// One-way trust: `who` trusts `whom`.
pub fn trusts(who: &Client, whom: &Client) {
    who.trust
        .trust_fingerprint(&whom.manager.own_fingerprint().unwrap());
}
