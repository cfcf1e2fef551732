//! Fatal error taxonomy. Every variant aborts generation; this is a
//! build-time compiler, so there is no retry or partial-success mode.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown directive key, wrong value kind, undefined PRESERVE
    /// reference, or a heterogeneous node list.
    #[error("directive error at {location}: {message}")]
    Directive { message: String, location: String },

    /// Id collisions, ambiguous partial-id lookups, undefined or
    /// duplicate rules, illegal type merges, unsupported grammar shapes.
    #[error("resolution error: {message}")]
    Resolution { message: String },

    /// A defect in the tool or its inputs that no grammar should be able
    /// to trigger through ordinary absence of data.
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("xml error: {0}")]
    Xml(#[from] roxmltree::Error),
}

impl Error {
    pub fn directive(message: impl Into<String>, location: impl Into<String>) -> Self {
        Error::Directive { message: message.into(), location: location.into() }
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Error::Resolution { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal { message: message.into() }
    }
}
