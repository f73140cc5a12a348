use super::*;

use std::borrow::Cow;

use async_ssh2_tokio::ServerCheckMethod;
use russh::Preferred;

/// Security level used for SSH algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SecurityLevel {
    /// Modern algorithms only.
    Secure,
    /// Modern algorithms plus CBC ciphers, SHA-1 key exchange and DSA keys.
    LegacyCompatible,
}

/// Parameters applied when dialing a device.
///
/// The default trusts any host key and offers the extended algorithm list:
/// devices live on a closed management network and often run firmware
/// that only speaks legacy algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOptions {
    /// TCP connect plus SSH handshake deadline.
    pub connect_timeout: Duration,
    /// SSH algorithm policy.
    pub level: SecurityLevel,
    /// Server host key verification method.
    pub server_check: ServerCheckMethod,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self::legacy_compatible()
    }
}

impl DialOptions {
    /// Trust-on-first-use profile with the extended cipher suite.
    pub fn legacy_compatible() -> Self {
        Self {
            connect_timeout: config::DIAL_TIMEOUT,
            level: SecurityLevel::LegacyCompatible,
            server_check: ServerCheckMethod::NoCheck,
        }
    }

    /// Modern algorithms with known-hosts verification.
    pub fn secure() -> Self {
        Self {
            connect_timeout: config::DIAL_TIMEOUT,
            level: SecurityLevel::Secure,
            server_check: ServerCheckMethod::DefaultKnownHostsFile,
        }
    }

    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            connect_timeout: engine.dial_timeout(),
            ..Self::legacy_compatible()
        }
    }

    pub(super) fn preferred(&self) -> Preferred {
        match self.level {
            SecurityLevel::Secure => Preferred {
                kex: Cow::Borrowed(config::SECURE_KEX_ORDER),
                key: Cow::Borrowed(config::SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(config::SECURE_CIPHERS),
                mac: Cow::Borrowed(config::SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(config::LEGACY_KEX_ORDER),
                key: Cow::Borrowed(config::LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(config::LEGACY_CIPHERS),
                mac: Cow::Borrowed(config::LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }
}
