//! Error types for magitrickle
//!
//! This module defines the error hierarchy for the traffic steering daemon.
//! Errors are categorized by subsystem and include recovery hints.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for magitrickle
#[derive(Debug, Error)]
pub enum MagitrickleError {
    /// Configuration errors (file parsing, validation, version)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Netfilter adapter errors (iptables, ipset, ip)
    #[error("Netfilter error: {0}")]
    Netfilter(#[from] NetfilterError),

    /// DNS proxy errors
    #[error("DNS proxy error: {0}")]
    DnsProxy(#[from] DnsProxyError),

    /// Group lifecycle errors
    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    /// Control socket errors
    #[error("Control socket error: {0}")]
    Control(#[from] ControlError),

    /// The app is already running
    #[error("already running")]
    AlreadyRunning,

    /// A panic escaped the app run and was converted into an error
    #[error("recovered error: {0}")]
    Panic(String),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MagitrickleError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Netfilter(e) => e.is_recoverable(),
            Self::DnsProxy(e) => e.is_recoverable(),
            Self::Group(e) => e.is_recoverable(),
            Self::Control(e) => e.is_recoverable(),
            Self::AlreadyRunning | Self::Panic(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Unsupported `config_version`
    #[error("config unsupported version: {0}")]
    UnsupportedVersion(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Netfilter adapter errors (iptables, ip6tables, ipset, ip)
#[derive(Debug, Error)]
pub enum NetfilterError {
    /// Failed to spawn the control binary
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A control command exited with a non-zero status
    #[error("{program} {args} failed (status {status}): {stderr}")]
    CommandFailed {
        program: String,
        args: String,
        status: i32,
        stderr: String,
    },

    /// Failed to parse command output
    #[error("Failed to parse {program} output: {reason}")]
    ParseOutput { program: String, reason: String },
}

impl NetfilterError {
    /// Netfilter failures are transient at the logical level: the
    /// reconciliation hooks re-assert state, so callers may retry.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Spawn { .. } => false,
            Self::CommandFailed { .. } | Self::ParseOutput { .. } => true,
        }
    }

    /// Create a command failure error
    pub fn command_failed(
        program: impl Into<String>,
        args: &[&str],
        status: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            program: program.into(),
            args: args.join(" "),
            status,
            stderr: stderr.into(),
        }
    }

    /// Create an output parse error
    pub fn parse_output(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseOutput {
            program: program.into(),
            reason: reason.into(),
        }
    }
}

/// DNS proxy errors
#[derive(Debug, Error)]
pub enum DnsProxyError {
    /// Failed to bind a listener
    #[error("Failed to bind DNS listener to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Network I/O error
    #[error("DNS network error: {context}")]
    NetworkError {
        context: String,
        #[source]
        source: Option<io::Error>,
    },

    /// DNS message parsing failed
    #[error("Failed to parse DNS message: {0}")]
    ParseError(String),

    /// DNS message serialization failed
    #[error("Failed to serialize DNS message: {0}")]
    SerializeError(String),

    /// Upstream query timed out
    #[error("Upstream query to {addr} timed out after {timeout:?}")]
    UpstreamTimeout { addr: SocketAddr, timeout: Duration },

    /// Invalid listen or upstream address
    #[error("Invalid DNS address '{0}'")]
    InvalidAddress(String),
}

impl DnsProxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } | Self::InvalidAddress(_) => false,
            Self::ParseError(_) | Self::SerializeError(_) | Self::UpstreamTimeout { .. } => true,
            Self::NetworkError { source, .. } => match source {
                Some(e) => !matches!(
                    e.kind(),
                    io::ErrorKind::PermissionDenied
                        | io::ErrorKind::AddrInUse
                        | io::ErrorKind::OutOfMemory
                ),
                None => true,
            },
        }
    }

    /// Create a network error wrapping an I/O error
    pub fn network_io(context: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a network error without an I/O source
    pub fn network(context: impl Into<String>) -> Self {
        Self::NetworkError {
            context: context.into(),
            source: None,
        }
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a serialization error
    pub fn serialize(msg: impl Into<String>) -> Self {
        Self::SerializeError(msg.into())
    }
}

/// Group lifecycle errors
#[derive(Debug, Error)]
pub enum GroupError {
    /// A group with the same id already exists
    #[error("group id conflict")]
    GroupIdConflict,

    /// Two rules within a group share an id
    #[error("rule id conflict")]
    RuleIdConflict,

    /// Two groups derived the same firewall mark or routing table
    #[error("routing mark collision between groups {first} and {second}")]
    MarkCollision { first: String, second: String },

    /// A rule pattern failed to compile
    #[error("invalid rule pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Underlying netfilter failure
    #[error(transparent)]
    Netfilter(#[from] NetfilterError),
}

impl GroupError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::GroupIdConflict
            | Self::RuleIdConflict
            | Self::MarkCollision { .. }
            | Self::InvalidPattern { .. } => false,
            Self::Netfilter(e) => e.is_recoverable(),
        }
    }
}

/// Control socket errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Failed to create or replace the socket file
    #[error("Failed to create control socket at {path}: {reason}")]
    SocketCreation { path: String, reason: String },

    /// Failed to bind the UNIX socket
    #[error("Failed to bind control socket to {path}: {reason}")]
    BindError { path: String, reason: String },

    /// I/O error
    #[error("Control socket I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ControlError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation { .. } | Self::BindError { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }
}

/// Type alias for Result with `MagitrickleError`
pub type Result<T> = std::result::Result<T, MagitrickleError>;
