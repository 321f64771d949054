//! Transport contracts.
//!
//! The engine talks to the XMPP layer exclusively through these traits. A
//! transport adapter owns stanza routing and XML serialization; the engine
//! only ever sees typed wire elements. Blocking methods take a timeout as
//! their cancellation signal and report transient failures through
//! [`TransportError`].

use std::time::Duration;

use chirp_shared::element::{BundleElement, DeviceListElement, OmemoElement};
use chirp_shared::{BareJid, DeviceId, OmemoDevice};

/// Transient transport failures; callers may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("no response from server")]
    NoResponse,

    #[error("operation interrupted")]
    Interrupted,
}

/// Access model requested for published pub-sub items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessModel {
    /// Readable by anyone; required for bundles and device lists so that
    /// strangers can initiate sessions.
    Open,
    /// Readable by presence subscribers only.
    Presence,
}

/// An encrypted message ready for stanza assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub element: OmemoElement,
    /// Sentinel plaintext body for clients without OMEMO support.
    pub body: Option<String>,
    /// Ask the archive to store this message despite a missing body.
    pub store_hint: bool,
    /// Attach an explicit-message-encryption marker.
    pub eme_hint: bool,
}

/// Caller-provided view of a multi-user chat, resolved by the MUC layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room: BareJid,
    /// Bare JIDs of the room members.
    pub members: Vec<BareJid>,
    pub members_only: bool,
    pub non_anonymous: bool,
}

impl RoomInfo {
    /// OMEMO in a room requires knowing who the members are and that the
    /// membership is closed.
    pub fn supports_omemo(&self) -> bool {
        self.members_only && self.non_anonymous
    }
}

/// Stanza send/receive surface of an authenticated XMPP connection.
pub trait Connection: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Bare JID of the authenticated account, once known.
    fn own_jid(&self) -> Option<BareJid>;

    fn send_message(&self, to: &BareJid, message: &OutboundMessage)
        -> Result<(), TransportError>;
}

/// Publish-subscribe surface (PEP nodes for device lists and bundles).
pub trait PubSub: Send + Sync {
    fn publish_device_list(
        &self,
        list: &DeviceListElement,
        access: AccessModel,
    ) -> Result<(), TransportError>;

    fn fetch_device_list(
        &self,
        owner: &BareJid,
        timeout: Duration,
    ) -> Result<Option<DeviceListElement>, TransportError>;

    fn publish_bundle(
        &self,
        device_id: DeviceId,
        bundle: &BundleElement,
        access: AccessModel,
    ) -> Result<(), TransportError>;

    fn fetch_bundle(
        &self,
        device: &OmemoDevice,
        timeout: Duration,
    ) -> Result<Option<BundleElement>, TransportError>;
}
