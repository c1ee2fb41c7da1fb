//! XPath 3.1 query engine using xee-xpath
//!
//! Queries run against a handle as context item and always yield node sets.
//! CSS selectors are translated to XPath first (see [`css_to_xpath`]).

mod css;
mod engine;

pub use css::css_to_xpath;
pub use engine::QueryEngine;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::handle::NodeHandle;
use crate::manipulation::broadcast;
use crate::node_set::NodeSet;

/// Prefix → namespace URI bindings consulted for prefixed names in a query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceBindings(BTreeMap<String, String>);

impl NamespaceBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `prefix`; an existing binding for the prefix is replaced
    pub fn insert(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.0.insert(prefix.into(), uri.into());
    }

    pub fn get(&self, prefix: &str) -> Option<&str> {
        self.0.get(prefix).map(String::as_str)
    }

    pub fn remove(&mut self, prefix: &str) -> Option<String> {
        self.0.remove(prefix)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }

    /// Layer `other` on top of these bindings
    pub fn merged(&self, other: &NamespaceBindings) -> NamespaceBindings {
        let mut merged = self.clone();
        for (prefix, uri) in other.iter() {
            merged.insert(prefix, uri);
        }
        merged
    }
}

impl<P: Into<String>, U: Into<String>> FromIterator<(P, U)> for NamespaceBindings {
    fn from_iter<T: IntoIterator<Item = (P, U)>>(iter: T) -> Self {
        let mut bindings = NamespaceBindings::new();
        for (prefix, uri) in iter {
            bindings.insert(prefix, uri);
        }
        bindings
    }
}

/// Selection by XPath or CSS, with the receiver as context
pub trait NodeQuery {
    fn query_with_xpath(&self, xpath: &str) -> Result<NodeSet>;

    fn query_with_css(&self, selector: &str) -> Result<NodeSet>;

    /// Shorthand for [`NodeQuery::query_with_xpath`]
    fn query(&self, xpath: &str) -> Result<NodeSet> {
        self.query_with_xpath(xpath)
    }

    /// Shorthand for [`NodeQuery::query_with_css`]
    fn css(&self, selector: &str) -> Result<NodeSet> {
        self.query_with_css(selector)
    }
}

impl NodeQuery for NodeHandle {
    fn query_with_xpath(&self, xpath: &str) -> Result<NodeSet> {
        QueryEngine::new().evaluate(self, xpath)
    }

    fn query_with_css(&self, selector: &str) -> Result<NodeSet> {
        QueryEngine::new().select(self, selector)
    }
}

/// Results of every member, concatenated in member order
impl NodeQuery for NodeSet {
    fn query_with_xpath(&self, xpath: &str) -> Result<NodeSet> {
        let found = broadcast(self, |_, member| member.query_with_xpath(xpath))?;
        Ok(found.into_iter().flatten().collect())
    }

    fn query_with_css(&self, selector: &str) -> Result<NodeSet> {
        let found = broadcast(self, |_, member| member.query_with_css(selector))?;
        Ok(found.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_bindings_override() {
        let base: NamespaceBindings = [("a", "urn:a"), ("b", "urn:b")].into_iter().collect();
        let overlay: NamespaceBindings = [("b", "urn:other")].into_iter().collect();
        let merged = base.merged(&overlay);
        assert_eq!(merged.get("a"), Some("urn:a"));
        assert_eq!(merged.get("b"), Some("urn:other"));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_bindings_serde() {
        let bindings: NamespaceBindings = serde_json::from_str(r#"{"x": "urn:x"}"#).unwrap();
        assert_eq!(bindings.get("x"), Some("urn:x"));
    }
}
