//! chirp-shared -- identifiers and wire model shared across the chirp crates.
//!
//! Holds the types that cross the boundary between the OMEMO engine and the
//! XMPP transport adapter: bare JIDs, device identifiers, the typed wire
//! elements (`encrypted`, `list`, `bundle`) and the protocol constants that
//! name PEP nodes and namespaces.
//!
//! XML parsing and serialization of the wire elements is deliberately absent;
//! transport adapters convert between these structs and their stanza
//! representation.

pub mod constants;
pub mod device;
pub mod element;
pub mod jid;

pub use device::{DeviceId, OmemoDevice};
pub use jid::BareJid;
