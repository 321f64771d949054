//! Bare JID handling.
//!
//! A bare JID is `localpart@domainpart` (or just a domain for components and
//! MUC services), without any resource. The engine keys all per-identity
//! state on bare JIDs, so normalization happens once at construction.

use serde::{Deserialize, Serialize};

/// Error returned when a string cannot be parsed as a bare JID.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JidError {
    #[error("empty jid")]
    Empty,

    #[error("jid contains a resource separator: {0}")]
    ResourceNotAllowed(String),

    #[error("jid has an empty localpart or domainpart: {0}")]
    EmptyPart(String),
}

/// A bare JID, lowercased at construction.
///
/// Equality and hashing are case-insensitive by construction, matching how
/// XMPP servers compare addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BareJid(String);

impl BareJid {
    /// Parse and normalize a bare JID.
    ///
    /// Rejects full JIDs (anything containing `/`). A missing localpart is
    /// allowed so that domain JIDs (servers, MUC services) can be represented.
    pub fn new(s: &str) -> Result<Self, JidError> {
        if s.is_empty() {
            return Err(JidError::Empty);
        }
        if s.contains('/') {
            return Err(JidError::ResourceNotAllowed(s.to_string()));
        }
        match s.split_once('@') {
            Some((local, domain)) if local.is_empty() || domain.is_empty() => {
                Err(JidError::EmptyPart(s.to_string()))
            }
            _ => Ok(BareJid(s.to_lowercase())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The domainpart of this JID.
    pub fn domain(&self) -> &str {
        match self.0.split_once('@') {
            Some((_, domain)) => domain,
            None => &self.0,
        }
    }
}

impl std::fmt::Display for BareJid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BareJid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BareJid::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn new_accepts_user_at_domain() {
        let jid = BareJid::new("alice@wonderland.lit").unwrap();
        assert_eq!(jid.as_str(), "alice@wonderland.lit");
        assert_eq!(jid.domain(), "wonderland.lit");
    }

    #[test]
    fn new_accepts_plain_domain() {
        let jid = BareJid::new("conference.wonderland.lit").unwrap();
        assert_eq!(jid.domain(), "conference.wonderland.lit");
    }

    #[test]
    fn new_lowercases() {
        let jid = BareJid::new("Alice@Wonderland.LIT").unwrap();
        assert_eq!(jid.as_str(), "alice@wonderland.lit");
    }

    #[test]
    fn mixed_case_jids_compare_equal() {
        let a = BareJid::new("Bob@example.org").unwrap();
        let b = BareJid::new("bob@EXAMPLE.org").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn new_rejects_full_jid() {
        let result = BareJid::new("alice@wonderland.lit/phone");
        assert_eq!(
            result,
            Err(JidError::ResourceNotAllowed(
                "alice@wonderland.lit/phone".to_string()
            ))
        );
    }

    #[test]
    fn new_rejects_empty() {
        assert_eq!(BareJid::new(""), Err(JidError::Empty));
    }

    #[test]
    fn new_rejects_empty_localpart() {
        assert!(matches!(
            BareJid::new("@example.org"),
            Err(JidError::EmptyPart(_))
        ));
    }

    #[test]
    fn new_rejects_empty_domainpart() {
        assert!(matches!(BareJid::new("alice@"), Err(JidError::EmptyPart(_))));
    }

    #[test]
    fn from_str_round_trips_display() {
        let jid = BareJid::from_str("carol@example.org").unwrap();
        assert_eq!(jid.to_string(), "carol@example.org");
    }

    #[test]
    fn serde_round_trip_is_transparent() {
        let jid = BareJid::new("dave@example.org").unwrap();
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"dave@example.org\"");
        let back: BareJid = serde_json::from_str(&json).unwrap();
        assert_eq!(jid, back);
    }
}
