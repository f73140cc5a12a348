//! Error types for device sessions, mode transitions and command execution.
//!
//! Every failure the engine can hit is converted into a [`ConnectError`];
//! command execution wraps it in an [`ExecError`] so whatever output was
//! captured before the failure still reaches the caller.

use std::time::Duration;

use thiserror::Error;

use crate::session::CommandResults;

/// Errors that can occur while dialing, reading, writing or switching modes.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The request named a protocol other than `ssh` or `telnet`.
    #[error("protocol {0} not support")]
    UnsupportedProtocol(String),

    /// The transport could not be established (bad address, auth rejected,
    /// network error, or the post-login read failed).
    #[error("dial {addr} error, {reason}")]
    DialFailure { addr: String, reason: String },

    /// The transport did not connect within the dial timeout.
    #[error("dial {0} timeout")]
    DialTimeout(String),

    /// Writing a command to the transport failed.
    #[error("write buff failed, {0}")]
    WriteFailure(String),

    /// Reading from the transport failed.
    #[error("read failed, {0}")]
    ReadFailure(String),

    /// The remote end closed the stream while a prompt was awaited.
    #[error("channel disconnect on wait prompt")]
    ChannelDisconnectError,

    /// No prompt matched before the request deadline.
    #[error("read stdout timeout after {0:?}")]
    ReadTimeout(Duration),

    /// A prompt matched but a line of the output matched a device error pattern.
    #[error("err pattern matched, {0}")]
    DeviceErrorPattern(String),

    /// A step of a mode transition failed.
    #[error("transit {from} -> {to} failed at '{command}': {source}")]
    TransitionFailure {
        from: String,
        to: String,
        command: String,
        #[source]
        source: Box<ConnectError>,
    },

    /// The target mode cannot be reached through the operator's edges.
    #[error("unreachable state {0}")]
    UnreachableState(String),

    /// Operator tables could not be compiled.
    #[error("invalid operator config: {0}")]
    InvalidOperatorConfig(String),

    /// No built-in template with this name.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// The session was closed (explicitly or by the heartbeat).
    #[error("session {0} closed")]
    SessionClosed(String),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// An I/O error on the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Returns true for failures raised by the byte transport itself,
    /// including ones hit while switching modes.
    pub fn is_transport(&self) -> bool {
        match self {
            ConnectError::TransitionFailure { source, .. } => source.is_transport(),
            _ => matches!(
                self,
                ConnectError::WriteFailure(_)
                    | ConnectError::ReadFailure(_)
                    | ConnectError::ChannelDisconnectError
                    | ConnectError::Io(_)
                    | ConnectError::RusshError(_)
                    | ConnectError::Ssh2Error(_)
            ),
        }
    }
}

/// Failure of a command execution, carrying the results captured so far.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct ExecError {
    /// Command outputs collected before the failing step.
    pub partial: CommandResults,
    #[source]
    pub source: ConnectError,
}

impl ExecError {
    pub fn new(partial: CommandResults, source: ConnectError) -> Self {
        Self { partial, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_classified() {
        assert!(ConnectError::WriteFailure("broken pipe".to_string()).is_transport());
        assert!(ConnectError::ChannelDisconnectError.is_transport());
        assert!(!ConnectError::ReadTimeout(Duration::from_secs(5)).is_transport());
        assert!(!ConnectError::DeviceErrorPattern("% Invalid input".to_string()).is_transport());
    }

    #[test]
    fn transition_failure_takes_class_of_its_cause() {
        let wrap = |source| ConnectError::TransitionFailure {
            from: "login".to_string(),
            to: "enable".to_string(),
            command: "enable".to_string(),
            source: Box::new(source),
        };
        assert!(wrap(ConnectError::ReadFailure("reset".to_string())).is_transport());
        assert!(!wrap(ConnectError::ReadTimeout(Duration::from_secs(1))).is_transport());
    }

    #[test]
    fn exec_error_displays_its_cause() {
        let err = ExecError::new(CommandResults::new(), ConnectError::SessionClosed("r1:23".to_string()));
        assert_eq!(err.to_string(), ConnectError::SessionClosed("r1:23".to_string()).to_string());
        assert!(err.partial.is_empty());
    }
}
