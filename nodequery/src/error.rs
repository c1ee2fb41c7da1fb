//! Error types shared by every component
//!
//! Every fallible call returns [`Result`]. The same error is also cached on
//! the [`NodeHandle`](crate::NodeHandle) that produced it, see
//! [`NodeHandle::last_error`](crate::NodeHandle::last_error).

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::handle::NodeKind;
use crate::store::NodeKey;

/// Error domain reported by [`Error::domain`]
pub const ERROR_DOMAIN: &str = "nodequery";

/// Result type for node query and manipulation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Domain tag of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
pub enum ErrorKind {
    #[strum(serialize = "ParseFragmentError")]
    ParseFragment,
    #[strum(serialize = "QueryExpressionError")]
    QueryExpression,
    #[strum(serialize = "InvalidNodeOperation")]
    InvalidNodeOperation,
    #[strum(serialize = "StaleHandleError")]
    StaleHandle,
    #[strum(serialize = "DocumentParseError")]
    DocumentParse,
    #[strum(serialize = "SerializeError")]
    Serialize,
    #[strum(serialize = "ConfigError")]
    Config,
}

/// Errors that can occur while querying or manipulating a document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Markup handed to a manipulation call is not a well-formed fragment
    #[error("Failed to parse fragment: {0}")]
    ParseFragment(String),
    /// Malformed XPath/CSS, unresolved prefix, or a non node-set result
    #[error("Failed to evaluate query: {0}")]
    QueryExpression(String),
    /// Operation does not apply to the kind of node
    #[error("Invalid operation on {kind} node: {message}")]
    InvalidNodeOperation { kind: NodeKind, message: String },
    /// Handle points at a detached, merged or dropped node
    #[error("Stale node handle: {0}")]
    StaleHandle(String),
    /// The document itself could not be parsed
    #[error("Failed to parse document: {0}")]
    DocumentParse(String),
    #[error("Failed to serialize: {0}")]
    Serialize(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// A broadcast over a node set failed at member `index`
    ///
    /// Members before `index` keep their mutation.
    #[error("Node set member {index} failed: {source}")]
    Broadcast {
        index: usize,
        key: Option<NodeKey>,
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn invalid(kind: NodeKind, message: impl Into<String>) -> Self {
        Error::InvalidNodeOperation {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn stale(message: impl Into<String>) -> Self {
        Error::StaleHandle(message.into())
    }

    /// Domain tag of this error; broadcast errors report their cause
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ParseFragment(_) => ErrorKind::ParseFragment,
            Error::QueryExpression(_) => ErrorKind::QueryExpression,
            Error::InvalidNodeOperation { .. } => ErrorKind::InvalidNodeOperation,
            Error::StaleHandle(_) => ErrorKind::StaleHandle,
            Error::DocumentParse(_) => ErrorKind::DocumentParse,
            Error::Serialize(_) => ErrorKind::Serialize,
            Error::Config(_) => ErrorKind::Config,
            Error::Broadcast { source, .. } => source.kind(),
        }
    }

    pub fn domain(&self) -> &'static str {
        ERROR_DOMAIN
    }

    /// Index of the failing member for broadcast errors
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            Error::Broadcast { index, .. } => Some(*index),
            _ => None,
        }
    }
}

impl From<std::fmt::Error> for Error {
    fn from(e: std::fmt::Error) -> Self {
        Error::Serialize(e.to_string())
    }
}
