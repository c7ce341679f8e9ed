//! Shared error plumbing for wire-facing failures.

use envelope::Outbound;

/// Grepable error code and retryable flag for errors that cross the wire.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    /// Whether the caller may retry the same operation unchanged.
    fn retryable(&self) -> bool {
        false
    }
}

/// Render a typed error as an `error` envelope for the offending client.
pub fn error_envelope(err: &(impl ErrorCode + ?Sized)) -> Outbound {
    Outbound::error(format!("{}: {}", err.error_code(), err))
}
