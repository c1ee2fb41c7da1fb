//! nodequery: jQuery-style node sets over XML documents
//!
//! This library provides:
//! - Node handles with stable identity over a mutable xot tree
//! - XPath 3.1 and CSS selector queries yielding node sets
//! - Fragment insertion, moves, removal and namespace stripping
//! - Namespace-aware XML serialization
//!
//! ```no_run
//! use nodequery::{Document, NodeManipulation};
//!
//! let doc = Document::parse("<ul><li>one</li></ul>")?;
//! doc.css("ul")?.append("<li>two</li>")?;
//! assert_eq!(doc.query("//li")?.len(), 2);
//! # Ok::<(), nodequery::Error>(())
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod handle;
pub mod manipulation;
pub mod node_set;
pub mod query;
pub mod serial;
mod store;

pub use config::Config;
pub use document::Document;
pub use error::{Error, ErrorKind, Result, ERROR_DOMAIN};
pub use handle::{NodeHandle, NodeKind};
pub use manipulation::{Content, NodeManipulation, Position};
pub use node_set::NodeSet;
pub use query::{css_to_xpath, NamespaceBindings, NodeQuery, QueryEngine};
pub use serial::SerializeOptions;
pub use store::NodeKey;
