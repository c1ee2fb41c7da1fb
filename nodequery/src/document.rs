//! Document: the owner of a parsed tree
//!
//! Every [`NodeHandle`] refers back to the document that produced it without
//! keeping it alive. Dropping the document releases the whole tree, including
//! subtrees detached by earlier removals.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handle::{NodeHandle, NodeKind};
use crate::node_set::NodeSet;
use crate::query::{NamespaceBindings, NodeQuery};
use crate::serial::{self, SerializeOptions};
use crate::store::{Slot, TreeStore};

pub struct Document {
    store: Rc<RefCell<TreeStore>>,
}

impl Document {
    /// Parse `xml` with the default [`Config`]
    pub fn parse(xml: &str) -> Result<Self> {
        Self::parse_with_config(xml, &Config::default())
    }

    pub fn parse_with_config(xml: &str, config: &Config) -> Result<Self> {
        let store = TreeStore::load(xml, config)?;
        tracing::debug!(
            "loaded document {} ({} bytes, {} namespace bindings)",
            store.id(),
            xml.len(),
            config.namespaces.len()
        );
        Ok(Document {
            store: Rc::new(RefCell::new(store)),
        })
    }

    /// Handle to the document node
    pub fn root(&self) -> NodeHandle {
        let root = self.store.borrow().root();
        NodeHandle::new(&self.store, Slot::Node(root))
    }

    /// Handle to the single top-level element
    pub fn document_element(&self) -> Result<NodeHandle> {
        let element = {
            let tree = self.store.borrow();
            tree.xot()
                .document_element(tree.root())
                .map_err(|e| Error::invalid(NodeKind::Document, e.to_string()))?
        };
        Ok(NodeHandle::new(&self.store, Slot::Node(element)))
    }

    /// Serialize with the options from the document's [`Config`]
    pub fn xml(&self) -> Result<String> {
        let tree = self.store.borrow();
        serial::render(&tree, Slot::Node(tree.root()), &tree.serialize_options, false)
    }

    pub fn xml_with(&self, options: &SerializeOptions) -> Result<String> {
        let tree = self.store.borrow();
        serial::render(&tree, Slot::Node(tree.root()), options, false)
    }

    /// Evaluate XPath with the document node as context
    pub fn query(&self, xpath: &str) -> Result<NodeSet> {
        self.root().query_with_xpath(xpath)
    }

    /// Select by CSS with the document node as context
    pub fn css(&self, selector: &str) -> Result<NodeSet> {
        self.root().query_with_css(selector)
    }

    /// Bind `prefix` for every query run against this document
    pub fn register_namespace(&self, prefix: &str, uri: &str) {
        let mut tree = self.store.borrow_mut();
        tree.bindings.insert(prefix, uri);
        tracing::debug!("document {}: bound prefix '{}' to {}", tree.id(), prefix, uri);
    }

    pub fn namespaces(&self) -> NamespaceBindings {
        self.store.borrow().bindings.clone()
    }

    /// Strip every namespace from the tree
    pub fn remove_namespaces(&self) -> Result<()> {
        self.root().remove_namespaces()
    }

    /// Counter bumped by every structural change
    pub fn generation(&self) -> u64 {
        self.store.borrow().generation()
    }

    pub fn id(&self) -> u64 {
        self.store.borrow().id()
    }
}

impl FromStr for Document {
    type Err = Error;

    fn from_str(xml: &str) -> Result<Self> {
        Document::parse(xml)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.store.try_borrow().map(|tree| tree.id()).ok();
        f.debug_struct("Document").field("id", &id).finish()
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if let Ok(tree) = self.store.try_borrow() {
            tracing::debug!(
                "dropping document {} ({} detached subtrees)",
                tree.id(),
                tree.detached_count()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manipulation::NodeManipulation;
    use crate::ErrorKind;

    #[test]
    fn test_parse_failure() {
        let err = Document::parse("<a><b></a>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DocumentParse);
        assert!("<a".parse::<Document>().is_err());
    }

    #[test]
    fn test_root_and_document_element() {
        let doc: Document = "<?xml version=\"1.0\"?><a><b/></a>".parse().unwrap();
        assert_eq!(doc.root().kind().unwrap(), NodeKind::Document);
        let a = doc.document_element().unwrap();
        assert_eq!(a.tag().unwrap().as_deref(), Some("a"));
        assert_eq!(a.parent().unwrap(), Some(doc.root()));
    }

    #[test]
    fn test_serialization_options_from_config() {
        let config = Config::new().with_serialize_options(SerializeOptions::new().with_xml_declaration(true));
        let doc = Document::parse_with_config("<a/>", &config).unwrap();
        assert_eq!(doc.xml().unwrap(), "<?xml version=\"1.0\" encoding=\"UTF-8\"?><a/>");
        assert_eq!(doc.xml_with(&SerializeOptions::default()).unwrap(), "<a/>");
    }

    #[test]
    fn test_config_namespaces_apply_to_queries() {
        let config = Config::new().with_namespace("h", "urn:h");
        let doc = Document::parse_with_config(r#"<r xmlns="urn:h"><p/></r>"#, &config).unwrap();
        assert_eq!(doc.query("//h:p").unwrap().len(), 1);
        assert_eq!(doc.namespaces().get("h"), Some("urn:h"));
    }

    #[test]
    fn test_register_namespace() {
        let doc = Document::parse(r#"<r xmlns="urn:h"><p/></r>"#).unwrap();
        assert!(doc.query("//x:p").is_err());
        doc.register_namespace("x", "urn:h");
        assert_eq!(doc.query("//x:p").unwrap().len(), 1);
    }

    #[test]
    fn test_generation_and_ids() {
        let doc = Document::parse("<a/>").unwrap();
        let other = Document::parse("<a/>").unwrap();
        assert_ne!(doc.id(), other.id());
        let before = doc.generation();
        doc.document_element().unwrap().append("<b/>").unwrap();
        assert!(doc.generation() > before);
    }

    #[test]
    fn test_remove_namespaces_on_document() {
        let doc = Document::parse(r#"<x:a xmlns:x="urn:x"><x:b x:k="1"/></x:a>"#).unwrap();
        doc.remove_namespaces().unwrap();
        assert_eq!(doc.xml().unwrap(), r#"<a><b k="1"/></a>"#);
    }
}
