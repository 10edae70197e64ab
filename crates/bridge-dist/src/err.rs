//! Error module for `bridge-dist`.

use thiserror::Error;

/// An error produced while answering a bridge request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The client's email address could not be parsed.
    #[error("malformed email address")]
    BadEmail,

    /// The client's email domain is not one we accept mail from.
    #[error("unsupported email domain: {domain:?}")]
    UnsupportedDomain {
        /// The (lowercased) domain the client mailed from.
        domain: String,
    },

    /// A configured domain rule was not recognized.
    #[error("unrecognized domain rule: {0:?}")]
    BadDomainRule(String),

    /// The sender asked again within the rate-limit window; this is the
    /// first rejection, so a warning reply should be sent.
    #[error("sender must wait {retry_in} more seconds")]
    TooSoon {
        /// Seconds until the sender's window opens again.
        retry_in: u64,
    },

    /// The sender asked again within the rate-limit window and has
    /// already been warned; no reply should be sent.
    #[error("sender was already warned; ignoring request")]
    Ignored,

    /// The persistent store failed.  No rate-limit state was changed;
    /// the client may retry later.
    #[error("storage error")]
    Storage(#[from] rusqlite::Error),
}
