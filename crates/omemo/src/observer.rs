//! Device-list observer: reacts to pub-sub events for the device-list node.
//!
//! Remote lists are merged into the registry. For our own list, the observer
//! guards the self-enrollment invariant: if a published list omits our
//! device id, the union is republished. Publishing happens on a separate
//! thread because pub-sub listeners are delivered synchronously and a
//! publish from inside the callback would deadlock the transport.

use std::sync::Arc;

use chirp_shared::element::DeviceListElement;
use chirp_shared::BareJid;

use crate::manager::OmemoManager;
use crate::registry;

/// Handle one device-list event from pub-sub.
///
/// Events without a sender are dropped; some servers emit them and they
/// cannot be attributed to an identity.
pub fn handle_device_list_event(
    manager: &Arc<OmemoManager>,
    from: Option<&BareJid>,
    list: &DeviceListElement,
) {
    let Some(from) = from else {
        tracing::warn!("dropping device-list event without sender");
        return;
    };

    let own_device = {
        let state = manager.lock_state();
        if let Err(e) = registry::merge_device_list(state.store.as_ref(), from, list) {
            tracing::warn!(owner = %from, error = %e, "failed to merge device list event");
            return;
        }
        state.own_device.clone()
    };

    let Some(own) = own_device else {
        // Not initialized yet; nothing to enroll.
        return;
    };
    if own.owner != *from || list.contains(own.id) {
        return;
    }

    tracing::info!(device = %own, "own device missing from published list, republishing");
    let mut enrolled = list.device_ids.clone();
    enrolled.insert(own.id);
    manager.republish_device_list_async(DeviceListElement::new(enrolled));
}
