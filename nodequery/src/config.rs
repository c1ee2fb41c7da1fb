//! Document configuration
//!
//! A [`Config`] is applied when a document is loaded. It can be built in code
//! or read from JSON:
//!
//! ```json
//! {
//!   "namespaces": { "h": "http://www.w3.org/1999/xhtml" },
//!   "serialize": { "pretty_print": true, "indent": "    " },
//!   "document_uri": "file:///page.xhtml"
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::NamespaceBindings;
use crate::serial::SerializeOptions;

pub const DEFAULT_DOCUMENT_URI: &str = "file:///document.xml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix bindings registered on the document at load
    pub namespaces: NamespaceBindings,
    /// Options used by [`Document::xml`](crate::Document::xml)
    pub serialize: SerializeOptions,
    /// URI the document is registered under for XPath evaluation
    pub document_uri: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespaces: NamespaceBindings::new(),
            serialize: SerializeOptions::default(),
            document_uri: DEFAULT_DOCUMENT_URI.to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        if config.document_uri.is_empty() {
            return Err(Error::Config("document_uri must not be empty".to_string()));
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.namespaces.insert(prefix, uri);
        self
    }

    pub fn with_serialize_options(mut self, options: SerializeOptions) -> Self {
        self.serialize = options;
        self
    }

    pub fn with_document_uri(mut self, uri: impl Into<String>) -> Self {
        self.document_uri = uri.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.namespaces.is_empty());
        assert_eq!(config.document_uri, DEFAULT_DOCUMENT_URI);
        assert!(!config.serialize.pretty_print);
    }

    #[test]
    fn test_from_json_partial() {
        let config = Config::from_json(r#"{"namespaces": {"h": "urn:h"}}"#).unwrap();
        assert_eq!(config.namespaces.get("h"), Some("urn:h"));
        assert_eq!(config.document_uri, DEFAULT_DOCUMENT_URI);
    }

    #[test]
    fn test_from_json_serialize_section() {
        let config = Config::from_json(r#"{"serialize": {"pretty_print": true, "indent": "\t"}}"#).unwrap();
        assert!(config.serialize.pretty_print);
        assert_eq!(config.serialize.indent, "\t");
        assert!(!config.serialize.xml_declaration);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = Config::from_json("{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = Config::from_json(r#"{"document_uri": ""}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_builders_and_json_roundtrip() {
        let config = Config::new()
            .with_namespace("x", "urn:x")
            .with_document_uri("file:///x.xml")
            .with_serialize_options(SerializeOptions::new().with_xml_declaration(true));
        let back = Config::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }
}
