// SPDX-License-Identifier: PMPL-1.0-or-later
//! Prepared plan cache error types.

use thiserror::Error;

/// Errors surfaced by the prepared plan cache.
///
/// Staleness is never reported here on the default lookup path: a stale plan
/// is reprepared. Peer failures are logged and absorbed by lookups; the
/// `RemoteFetch` variant only escapes from direct peer operations.
#[derive(Error, Debug)]
pub enum PreparedError {
    /// A different statement already lives under this name.
    #[error("prepared statement name collision: {name} already holds a different statement")]
    NameCollision { name: String },

    #[error("no such prepared statement: {0}")]
    NotFound(String),

    /// The decoded plan's embedded identity does not match the key it was
    /// stored or fetched under.
    #[error("encoded plan identity mismatch: expected {expected}, found {found}")]
    EncodingMismatch { expected: String, found: String },

    #[error("encoded plan version {found} is newer than supported version {supported}")]
    VersionMismatch { found: u32, supported: u32 },

    /// Recompiling a stale plan failed; carries the compile error verbatim.
    #[error(transparent)]
    Reprepare(#[from] CompileError),

    #[error("remote fetch of {key} from {peer} failed: {reason}")]
    RemoteFetch {
        peer: String,
        key: String,
        reason: String,
    },

    #[error("malformed encoded plan: {0}")]
    Decode(String),

    /// Only returned for metadata-only lookups, which never reprepare.
    #[error("prepared statement {0} is stale")]
    Stale(String),

    #[error("plan stability is not supported by the {0} plan store")]
    StabilityUnsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("plan persistence failed: {0}")]
    Persist(#[from] PersistError),
}

/// Errors from the external statement compiler (parser + planner).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("syntax error: {0}")]
    Parse(String),

    #[error("planning error: {0}")]
    Plan(String),
}

/// Errors from a peer transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("peer {peer} returned status {status}")]
    Status { peer: String, status: u16 },

    #[error("invalid response from {peer}: {reason}")]
    InvalidResponse { peer: String, reason: String },
}

/// Errors from a durable plan store.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plan store unavailable: {0}")]
    BackendUnavailable(String),

    #[error("corrupted plan store data: {0}")]
    CorruptedData(String),

    #[error("the {0} plan store does not persist plans")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reprepare_is_transparent() {
        let err = PreparedError::from(CompileError::Parse("unexpected token FROM".to_string()));
        assert_eq!(err.to_string(), "syntax error: unexpected token FROM");
    }

    #[test]
    fn test_mismatch_display() {
        let err = PreparedError::EncodingMismatch {
            expected: "p1".to_string(),
            found: "p2".to_string(),
        };
        assert!(err.to_string().contains("expected p1"));
        assert!(err.to_string().contains("found p2"));

        let err = PreparedError::VersionMismatch { found: 9, supported: 2 };
        assert!(err.to_string().contains("9"));
    }

    #[test]
    fn test_persist_error_wraps() {
        let err = PreparedError::from(PersistError::Unsupported("disabled".to_string()));
        assert!(err.to_string().contains("disabled"));
    }
}
