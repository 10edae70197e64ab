//! Error module for `bridge-hashring`.

use thiserror::Error;

/// An error produced while handling bridges or building filters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A bridge fingerprint was not 40 hexadecimal digits.
    #[error("bridge fingerprint must be 40 hex digits")]
    BadFingerprint,

    /// A country code was not two ASCII letters.
    #[error("unrecognized country code: {0:?}")]
    BadCountryCode(String),
}
