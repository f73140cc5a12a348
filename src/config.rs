//! Engine settings and SSH algorithm profiles.
//!
//! The timing constants mirror what network CLIs tolerate in practice: a
//! short dial timeout, a 30 second liveness probe, and small read chunks so
//! prompts are noticed as soon as they arrive. The algorithm lists cover
//! both modern servers and the legacy firmware still common on management
//! networks.

use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// Connect timeout applied to both SSH and Telnet dials.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between heartbeat probes on an idle session.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Size of a single transport read in the prompt loop.
pub const READ_CHUNK_SIZE: usize = 1000;

/// Timeout used when a request does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunable engine settings.
///
/// Durations are expressed in whole seconds so the struct can be loaded
/// from JSON documents written by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Dial timeout in seconds.
    pub dial_timeout_secs: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Bytes requested per transport read.
    pub read_chunk_size: usize,
    /// Read timeout applied when a request carries a zero timeout.
    pub default_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: DIAL_TIMEOUT.as_secs(),
            heartbeat_interval_secs: HEARTBEAT_INTERVAL.as_secs(),
            read_chunk_size: READ_CHUNK_SIZE,
            default_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConnectError> {
        let config: EngineConfig = serde_json::from_str(raw)
            .map_err(|e| ConnectError::InvalidOperatorConfig(format!("engine config: {e}")))?;
        if config.read_chunk_size == 0 {
            return Err(ConnectError::InvalidOperatorConfig(
                "engine config: read_chunk_size must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Key exchange algorithms accepted by legacy-compatible dials.
///
/// Curve25519 first, then every Diffie-Hellman group old firmware may
/// insist on.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G14_SHA256,
    kex::DH_G16_SHA512,
    kex::DH_GEX_SHA256,
    kex::DH_GEX_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G1_SHA1,
];

/// Ciphers accepted by legacy-compatible dials, CBC modes included.
pub const LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_192_CBC,
    cipher::AES_128_CBC,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];

/// Key exchange algorithms for modern servers only.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

pub const SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] =
    &[compression::NONE, compression::ZLIB, compression::ZLIB_LEGACY];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.read_chunk_size, 1000);
    }

    #[test]
    fn from_json_keeps_defaults_for_missing_fields() {
        let config = EngineConfig::from_json(r#"{"heartbeat_interval_secs": 5}"#)
            .expect("partial config should parse");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.dial_timeout(), DIAL_TIMEOUT);
    }

    #[test]
    fn from_json_rejects_zero_chunk_size() {
        let err = EngineConfig::from_json(r#"{"read_chunk_size": 0}"#)
            .expect_err("zero chunk size is invalid");
        assert!(matches!(err, ConnectError::InvalidOperatorConfig(_)));
    }

    #[test]
    fn legacy_profile_offers_cbc_ciphers() {
        assert!(LEGACY_CIPHERS.contains(&cipher::AES_128_CBC));
        assert!(!SECURE_CIPHERS.contains(&cipher::AES_128_CBC));
        assert!(LEGACY_KEX_ORDER.contains(&kex::DH_G1_SHA1));
    }
}
