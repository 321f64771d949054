//! Protocol constants for OMEMO under the legacy axolotl namespace.

use crate::device::DeviceId;

/// The OMEMO namespace (version 0, axolotl profile).
pub const OMEMO_NAMESPACE_V_AXOLOTL: &str = "eu.siacs.conversations.axolotl";

/// PEP node carrying an identity's device list.
pub const PEP_NODE_DEVICE_LIST: &str = "eu.siacs.conversations.axolotl.devicelist";

/// Service-discovery feature to advertise for device-list notifications.
pub const PEP_NODE_DEVICE_LIST_NOTIFY: &str = "eu.siacs.conversations.axolotl.devicelist+notify";

/// Prefix of the per-device bundle PEP node; the device id is appended.
pub const PEP_NODE_BUNDLES_PREFIX: &str = "eu.siacs.conversations.axolotl.bundles";

/// Hint body attached to outbound messages when configured, for clients
/// that cannot decrypt OMEMO.
pub const BODY_OMEMO_HINT: &str =
    "I sent you an OMEMO encrypted message but your client doesn't seem to support that.";

/// AES key length in bytes (AES-128-GCM per the axolotl profile).
pub const AES_KEY_LENGTH: usize = 16;

/// GCM initialization vector length in bytes.
pub const IV_LENGTH: usize = 12;

/// GCM authentication tag length in bytes.
pub const TAG_LENGTH: usize = 16;

/// Length of a hex-encoded identity fingerprint.
pub const FINGERPRINT_LENGTH: usize = 64;

/// The PEP node a device publishes its bundle to.
pub fn pep_node_bundle(device_id: DeviceId) -> String {
    format!("{PEP_NODE_BUNDLES_PREFIX}:{device_id}")
}
