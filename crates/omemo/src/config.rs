//! Engine configuration.
//!
//! Loaded from TOML with per-field defaults, so an empty string yields a
//! fully working configuration.

use serde::Deserialize;

/// Configuration knobs recognized by the OMEMO engine.
#[derive(Debug, Clone, Deserialize)]
pub struct OmemoConfig {
    /// Attach a sentinel plaintext body describing OMEMO to outbound
    /// messages. Default: true
    #[serde(default = "default_true")]
    pub add_omemo_hint_body: bool,
    /// Attach a storage hint asking the archive to keep bodiless messages.
    /// Default: true
    #[serde(default = "default_true")]
    pub add_mam_storage_hint: bool,
    /// Attach an explicit-message-encryption hint element. Default: true
    #[serde(default = "default_true")]
    pub add_eme_hint: bool,
    /// Target size of the one-time pre-key pool. Default: 100
    #[serde(default = "default_prekey_pool_target")]
    pub prekey_pool_target: u32,
    /// Pool size below which the pool is refilled and the bundle
    /// republished. Default: 20
    #[serde(default = "default_prekey_pool_low_water")]
    pub prekey_pool_low_water: u32,
    /// Days before the signed pre-key is rotated. Default: 7
    #[serde(default = "default_signed_prekey_max_age")]
    pub signed_prekey_max_age_days: u32,
    /// Days a rotated-out signed pre-key is kept for late deliveries.
    /// Default: 30
    #[serde(default = "default_signed_prekey_grace")]
    pub signed_prekey_grace_days: u32,
    /// Age in seconds after which a cached device list is refreshed in the
    /// background. Default: 900 (15 minutes)
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// Deadline in seconds for blocking transport operations (bundle fetch,
    /// device-list fetch). Default: 30
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_prekey_pool_target() -> u32 {
    100
}
fn default_prekey_pool_low_water() -> u32 {
    20
}
fn default_signed_prekey_max_age() -> u32 {
    7
}
fn default_signed_prekey_grace() -> u32 {
    30
}
fn default_stale_threshold_secs() -> u64 {
    900
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

impl Default for OmemoConfig {
    fn default() -> Self {
        Self {
            add_omemo_hint_body: default_true(),
            add_mam_storage_hint: default_true(),
            add_eme_hint: default_true(),
            prekey_pool_target: default_prekey_pool_target(),
            prekey_pool_low_water: default_prekey_pool_low_water(),
            signed_prekey_max_age_days: default_signed_prekey_max_age(),
            signed_prekey_grace_days: default_signed_prekey_grace(),
            stale_threshold_secs: default_stale_threshold_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl OmemoConfig {
    /// Parse a configuration from a TOML string; missing fields take their
    /// defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    pub fn stale_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch_timeout_secs)
    }
}
