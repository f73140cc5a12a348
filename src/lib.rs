//! # netcli - Network Device CLI Automation Client
//!
//! `netcli` drives the interactive command line of routers and switches over
//! SSH or Telnet. Terminal output has no framing, so the engine decides where
//! a command's output ends by matching the device prompt for the current CLI
//! mode, and moves the device between modes (login, enable, config, ...)
//! before running commands.
//!
//! ## Features
//!
//! - **Session Caching**: One live connection per device address, reused across requests
//! - **Admission Gates**: At most one operation per device at a time; devices proceed in parallel
//! - **Prompt-Driven Framing**: Output ends when the last line matches a prompt of the expected mode
//! - **Mode Transitions**: Shortest command path between modes, committed only on success
//! - **Heartbeat**: Idle sessions are probed and evicted when the device stops answering
//! - **Legacy Compatibility**: CBC ciphers and old key exchanges for ageing equipment
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use netcli::session::{CliRequest, ConnectionRegistry, Credentials};
//! use netcli::templates;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ConnectionRegistry::new();
//!     let operator = Arc::new(templates::cisco(Some("enable-secret"))?);
//!
//!     let request = CliRequest {
//!         address: "192.168.1.1:22".to_string(),
//!         protocol: "ssh".to_string(),
//!         credentials: Credentials {
//!             username: "admin".to_string(),
//!             password: "password".to_string(),
//!         },
//!         mode: "enable".to_string(),
//!         commands: vec!["show version".to_string()],
//!         timeout_secs: 30,
//!         log_prefix: "[core-sw-1]".to_string(),
//!     };
//!
//!     let mut lease = registry.acquire(request, operator).await?;
//!     let results = lease.exec().await?;
//!     registry.release(lease);
//!
//!     for (command, output) in results.iter() {
//!         println!("{command}:\n{output}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::ConnectionRegistry`] - Caches sessions and gates access per address
//! - [`session::Session`] - Read loop, mode state machine and command execution
//! - [`device::Operator`] - Vendor prompts, error patterns and mode transitions
//! - [`templates`] - Built-in operators for common vendors
//! - [`error::ConnectError`] - Error types for connection and execution
//! - [`config`] - Engine settings and SSH algorithm lists

pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod templates;
