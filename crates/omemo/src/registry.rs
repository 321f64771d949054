//! Device registry: cached device lists per identity.
//!
//! The registry never forgets a device it has seen. A published list
//! replaces the active set; anything previously known that is no longer
//! listed moves to the inactive set so its fingerprint history survives.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chirp_shared::element::DeviceListElement;
use chirp_shared::{BareJid, DeviceId, OmemoDevice};

use crate::error::OmemoError;
use crate::store::{unix_now, OmemoStore};

/// Locally cached view of one identity's device list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDeviceList {
    pub active: BTreeSet<DeviceId>,
    /// Devices seen in the past but absent from the latest published list.
    pub inactive: BTreeSet<DeviceId>,
}

impl CachedDeviceList {
    /// Apply a freshly published list. The published set becomes the active
    /// set; every known id missing from it becomes inactive.
    pub fn merge(&mut self, published: &BTreeSet<DeviceId>) {
        let known: BTreeSet<DeviceId> = self.active.union(&self.inactive).copied().collect();
        self.inactive = known.difference(published).copied().collect();
        self.active = published.clone();
    }

    pub fn is_active(&self, id: DeviceId) -> bool {
        self.active.contains(&id)
    }

    pub fn all_devices(&self) -> BTreeSet<DeviceId> {
        self.active.union(&self.inactive).copied().collect()
    }
}

/// Merge a published device list into the cache and persist the result.
pub fn merge_device_list(
    store: &dyn OmemoStore,
    owner: &BareJid,
    published: &DeviceListElement,
) -> Result<CachedDeviceList, OmemoError> {
    let mut cached = store.load_device_list(owner)?.unwrap_or_default();
    cached.merge(&published.device_ids);
    store.store_device_list(owner, &cached)?;
    tracing::debug!(
        owner = %owner,
        active = cached.active.len(),
        inactive = cached.inactive.len(),
        "merged device list"
    );
    Ok(cached)
}

/// Last-known active devices of `owner`, without touching the network.
pub fn active_devices(
    store: &dyn OmemoStore,
    owner: &BareJid,
) -> Result<Vec<OmemoDevice>, OmemoError> {
    let cached = store.load_device_list(owner)?.unwrap_or_default();
    Ok(cached
        .active
        .iter()
        .map(|&id| OmemoDevice::new(owner.clone(), id))
        .collect())
}

/// Whether the cached list for `owner` is missing or older than `threshold`.
pub fn is_stale(
    store: &dyn OmemoStore,
    owner: &BareJid,
    threshold: Duration,
) -> Result<bool, OmemoError> {
    match store.device_list_refreshed_at(owner)? {
        None => Ok(true),
        Some(at) => Ok(unix_now().saturating_sub(at) > threshold.as_secs() as i64),
    }
}
