//! Error kinds for the reconciliation engine
//!
//! Every error here is recovered where it happens: a failed discovery keeps the
//! previous route table, a rejected configuration keeps the previous generation
//! active, and a failed certificate acquisition falls back to another source.

use std::time::Duration;
use thiserror::Error;

/// Failure to list containers from the runtime
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Runtime socket unreachable or the connection broke mid-request
    #[error("cannot reach container runtime: {0}")]
    SocketConnect(String),

    /// Runtime answered with a non-2xx status
    #[error("container runtime returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    /// Response body could not be decoded
    #[error("malformed container runtime response: {0}")]
    Decode(String),

    /// Listing did not finish within the discovery timeout
    #[error("container listing timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure while reading the runtime event stream
#[derive(Debug, Error)]
pub enum EventStreamError {
    /// A single event could not be decoded; the stream is still usable
    #[error("malformed event: {0}")]
    Malformed(String),

    /// The connection failed; the stream must be reopened
    #[error("event stream failed: {0}")]
    Transport(String),
}

/// Failure while applying a rendered configuration
#[derive(Debug, Error)]
pub enum ReloadError {
    /// Candidate file could not be written or swapped into place
    #[error("failed to stage configuration: {0}")]
    Stage(#[from] std::io::Error),

    /// Serving engine rejected the candidate configuration
    #[error("configuration rejected by validator: {0}")]
    Validation(String),

    /// Configuration was swapped in but the engine did not reload
    #[error("serving engine reload failed: {0}")]
    Reload(String),

    /// Engine command could not be run at all
    #[error("failed to run engine command '{command}': {reason}")]
    Engine { command: String, reason: String },
}

/// Failure while obtaining or loading certificate material
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Certificate authority issuance failed
    #[error("certificate acquisition failed for {hostname}: {reason}")]
    Acquisition { hostname: String, reason: String },

    /// Certificate or key material is unreadable or invalid
    #[error("invalid certificate material: {0}")]
    Material(String),

    #[error("certificate store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CertificateError {
    pub fn acquisition(hostname: &str, reason: impl std::fmt::Display) -> Self {
        Self::Acquisition {
            hostname: hostname.to_string(),
            reason: reason.to_string(),
        }
    }
}
