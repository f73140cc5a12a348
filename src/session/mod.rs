//! Device sessions, the connection registry and command execution.
//!
//! This module turns an unframed terminal byte stream into discrete
//! command/response pairs. A [`ConnectionRegistry`] caches one [`Session`]
//! per device address and admits a single operation per address at a time;
//! the session drives mode transitions and commands through a prompt-driven
//! read loop, and a heartbeat task evicts sessions whose device went away.
//!
//! # Main Components
//!
//! - [`ConnectionRegistry`] - Process-wide session cache with per-address admission gates
//! - [`Session`] - One live device connection with its CLI mode
//! - [`Transport`] - Byte stream over SSH, Telnet, or a scripted stand-in
//! - [`CliRequest`] - What a caller wants run on a device
//! - [`CommandResults`] - Command outputs in issuance order

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use schemars::JsonSchema;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{self, EngineConfig};
use crate::device::{Operator, any_pattern_matches, last_line, normalize_prompt_line};
use crate::error::{ConnectError, ExecError};

pub use client::{INITIAL_MODE, Session};
pub use manager::{ConnectionRegistry, SessionLease};
pub use security::{DialOptions, SecurityLevel};
pub use transport::{
    Connector, NetworkConnector, ScriptedTransport, SshShell, SshTransport, TelnetTransport,
    Transport,
};

/// Transport protocol named by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Telnet,
}

impl FromStr for Protocol {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(Protocol::Ssh),
            "telnet" => Ok(Protocol::Telnet),
            _ => Err(ConnectError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ssh => f.write_str("ssh"),
            Protocol::Telnet => f.write_str("telnet"),
        }
    }
}

/// Login credentials for a device.
#[derive(Default, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A request to run commands on one device.
///
/// Requests are validated by the caller before they reach the engine.
#[derive(Default, Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CliRequest {
    /// Device address as `host:port`; the registry key.
    pub address: String,

    /// Transport protocol name, `ssh` or `telnet` (case-insensitive).
    pub protocol: String,

    pub credentials: Credentials,

    /// CLI mode the commands must run in, e.g. `login`, `enable`, `config`.
    pub mode: String,

    /// Commands to run, in order.
    pub commands: Vec<String>,

    /// Per-read timeout in seconds. Zero means the engine default.
    #[serde(default)]
    pub timeout_secs: u64,

    /// Correlation prefix prepended to every log line for this request.
    #[serde(default)]
    pub log_prefix: String,
}

impl CliRequest {
    pub fn protocol(&self) -> Result<Protocol, ConnectError> {
        self.protocol.parse()
    }

    /// Read timeout, falling back to `default` when unset.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        if self.timeout_secs == 0 {
            default
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }
}

/// Outcome of one read-loop cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutput {
    /// Everything read before the prompt, without the trailing line break.
    pub output: String,
    /// The matched prompt text.
    pub prompt: String,
}

/// Command outputs keyed by command text, in issuance order.
///
/// Running the same command twice keeps its first position and the latest
/// output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResults {
    entries: Vec<(String, String)>,
}

impl CommandResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, command: impl Into<String>, output: impl Into<String>) {
        let command = command.into();
        let output = output.into();
        match self.entries.iter_mut().find(|(c, _)| *c == command) {
            Some(entry) => entry.1 = output,
            None => self.entries.push((command, output)),
        }
    }

    pub fn get(&self, command: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| c == command)
            .map(|(_, o)| o.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(c, o)| (c.as_str(), o.as_str()))
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }
}

impl Serialize for CommandResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (command, output) in &self.entries {
            map.serialize_entry(command, output)?;
        }
        map.end()
    }
}

mod client;
mod heartbeat;
mod manager;
mod security;
mod transport;
