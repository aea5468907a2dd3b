//! Probe error types.
//!
//! Probe errors never leave a tick: the probers log them and report
//! "no reply" so the failure only counts toward the streak.

use thiserror::Error;

/// Errors that can occur while performing a remote probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe target {0:?}")]
    InvalidTarget(String),

    #[error("could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("socket setup failed: {0}")]
    Socket(#[from] std::io::Error),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("http exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("probe timed out")]
    Timeout,
}

pub type ProbeResult<T> = Result<T, ProbeError>;
