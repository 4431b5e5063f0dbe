//! Error types for the tag store abstraction.

use thiserror::Error;

/// Errors surfaced by a [`crate::TagStore`] backend.
///
/// The transient variants are retryable by policy: callers keep a bounded
/// retry budget and degrade (skip the field, or abort the cycle) once it is
/// exhausted. `NotFound` is fatal at startup for required tags and tolerated
/// mid-run only for optional ones.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row exists for the requested tag name.
    #[error("tag not found: {0}")]
    NotFound(String),

    /// A momentary backend fault while reading; safe to retry.
    #[error("transient read failure on tag {0}")]
    TransientRead(String),

    /// A momentary backend fault while writing; safe to retry.
    #[error("transient write failure on tag {0}")]
    TransientWrite(String),

    /// The stored bytes could not be decoded as a tag value.
    #[error("malformed value for tag {tag}: {raw:?}")]
    Codec { tag: String, raw: String },

    /// Non-transient backend failure (corruption, I/O, lock loss).
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a backend error from any displayable cause.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    /// Whether the error is worth retrying under a bounded budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRead(_) | Self::TransientWrite(_))
    }
}
