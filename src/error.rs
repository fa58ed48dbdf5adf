//! # Error Model
//!
//! Every fallible overlay operation reports one of five categories:
//!
//! | Category | Meaning | Typical handling |
//! |----------|---------|------------------|
//! | `Protocol` | Malformed frame, unexpected message, version skew | Drop the stream |
//! | `Security` | Pin mismatch, replay, rate limit, blocklist, bad signature | Drop, log with `event = "security"` |
//! | `Transient` | Timeout, unreachable peer, closed connection | Retry later |
//! | `Fatal` | Missing key material, unusable storage, bad config | Abort startup |
//! | `InvalidArgument` | Caller passed something unusable | Surface to caller |
//!
//! Internals mostly use `anyhow`; the public surface converts into [`MeshError`]
//! so callers can branch on the category.

use thiserror::Error;

use crate::crypto::SignatureError;

/// Security rejections. Each one is logged at `warn` by the code that raises it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityViolation {
    #[error("certificate fingerprint does not match pin for {identifier}")]
    PinMismatch { identifier: String },

    #[error("nonce already seen from {peer}")]
    Replay { peer: String },

    #[error("rate limited: {reason}")]
    RateLimited { reason: String },

    #[error("peer is blocklisted: {reason}")]
    Blocklisted { reason: String },

    #[error("claimed identity does not match authenticated key")]
    IdentityMismatch,

    #[error("bad signature: {0}")]
    BadSignature(#[from] SignatureError),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("security violation: {0}")]
    Security(#[from] SecurityViolation),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MeshError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        MeshError::Protocol(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        MeshError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        MeshError::Fatal(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        MeshError::InvalidArgument(msg.into())
    }

    /// Transient failures are worth retrying on the next publish or sync tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::Transient(_))
    }

    pub fn is_security(&self) -> bool {
        matches!(self, MeshError::Security(_))
    }
}

impl From<quinn::ConnectError> for MeshError {
    fn from(e: quinn::ConnectError) -> Self {
        MeshError::Transient(format!("connect: {e}"))
    }
}

impl From<quinn::ConnectionError> for MeshError {
    fn from(e: quinn::ConnectionError) -> Self {
        MeshError::Transient(format!("connection: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for MeshError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MeshError::Transient("timed out".to_string())
    }
}

impl From<std::io::Error> for MeshError {
    fn from(e: std::io::Error) -> Self {
        MeshError::Transient(format!("io: {e}"))
    }
}

pub type MeshResult<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_violations_nest_into_mesh_error() {
        let err: MeshError = SecurityViolation::PinMismatch {
            identifier: "10.0.0.5:50305".to_string(),
        }
        .into();
        assert!(err.is_security());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("10.0.0.5:50305"));
    }

    #[test]
    fn signature_errors_become_security_violations() {
        let err: SecurityViolation = SignatureError::VerificationFailed.into();
        assert_eq!(
            err.to_string(),
            "bad signature: signature verification failed"
        );
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = MeshError::transient("peer unreachable");
        assert!(err.is_retryable());
        assert!(!MeshError::fatal("no key").is_retryable());
    }
}
