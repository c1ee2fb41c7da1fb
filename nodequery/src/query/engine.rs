//! XPath evaluation against a document snapshot
//!
//! Every evaluation serializes the current tree, loads it into a fresh
//! xee-xpath `Documents`, runs the compiled query with the context node as
//! context item, and maps the resulting nodes back onto the live tree by
//! their child-index path. Serialization reproduces the tree structure
//! exactly, so the path of a snapshot node names the same live node.

use xee_xpath::context::StaticContextBuilder;
use xee_xpath::{Documents, Item, Queries, Query};
use xot::{Node, Value, Xot};

use super::{css_to_xpath, NamespaceBindings};
use crate::error::{Error, Result};
use crate::handle::NodeHandle;
use crate::node_set::NodeSet;
use crate::serial::{self, SerializeOptions};
use crate::store::{Slot, TreeStore};

/// Document order key: (child path of the node or its owner element,
/// 0 for the node itself / 1 namespace / 2 attribute, position on the owner)
type OrderKey = (Vec<usize>, u8, usize);

/// XPath query engine using xee-xpath
///
/// Carries namespace bindings layered over the document's own bindings.
#[derive(Debug, Clone, Default)]
pub struct QueryEngine {
    namespaces: NamespaceBindings,
}

impl QueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a prefix for queries run through this engine
    pub fn with_namespace(mut self, prefix: &str, uri: &str) -> Self {
        self.namespaces.insert(prefix, uri);
        self
    }

    pub fn with_namespaces(mut self, namespaces: NamespaceBindings) -> Self {
        self.namespaces = self.namespaces.merged(&namespaces);
        self
    }

    pub fn namespaces(&self) -> &NamespaceBindings {
        &self.namespaces
    }

    /// Evaluate `xpath` with `context` as context item
    ///
    /// The result holds nodes only, deduplicated and in document order.
    pub fn evaluate(&self, context: &NodeHandle, xpath: &str) -> Result<NodeSet> {
        let result = self.evaluate_xpath(context, xpath);
        context.track(result)
    }

    /// Translate a CSS selector and evaluate it like [`QueryEngine::evaluate`]
    pub fn select(&self, context: &NodeHandle, selector: &str) -> Result<NodeSet> {
        let result = css_to_xpath(selector).and_then(|xpath| {
            tracing::debug!("css `{}` translated to `{}`", selector, xpath);
            self.evaluate_xpath(context, &xpath)
        });
        context.track(result)
    }

    fn evaluate_xpath(&self, context: &NodeHandle, xpath: &str) -> Result<NodeSet> {
        let store = context.attached()?;
        let slots = {
            let tree = store.borrow();
            let node = match context.slot() {
                Slot::Node(node) => node,
                other => {
                    return Err(Error::invalid(
                        tree.kind(other),
                        "only tree nodes can be a query context",
                    ))
                }
            };
            let bindings = tree.bindings.merged(&self.namespaces);
            run(&tree, node, xpath, &bindings)?
        };
        tracing::debug!("xpath `{}` matched {} nodes", xpath, slots.len());
        Ok(slots
            .into_iter()
            .map(|slot| NodeHandle::new(&store, slot))
            .collect())
    }
}

fn run(store: &TreeStore, context: Node, xpath: &str, bindings: &NamespaceBindings) -> Result<Vec<Slot>> {
    let queries = if bindings.is_empty() {
        Queries::default()
    } else {
        let mut builder = StaticContextBuilder::default();
        builder.namespaces(bindings.iter());
        Queries::new(builder)
    };
    let query = queries
        .sequence(xpath)
        .map_err(|e| Error::QueryExpression(e.to_string()))?;

    // Load the current tree into xee-xpath
    let snapshot = serial::render(store, Slot::Node(store.root()), &SerializeOptions::default(), false)?;
    let mut documents = Documents::new();
    let uri = store.uri();
    let doc = documents
        .add_string(
            uri.try_into()
                .map_err(|e| Error::Config(format!("invalid document uri `{}`: {:?}", uri, e)))?,
            &snapshot,
        )
        .map_err(|e| Error::QueryExpression(format!("failed to load document: {}", e)))?;
    let snapshot_root = documents
        .document_node(doc)
        .ok_or_else(|| Error::QueryExpression("document snapshot has no root".to_string()))?;
    let snapshot_context = node_at(documents.xot(), snapshot_root, &child_path(store.xot(), context))
        .ok_or_else(|| Error::QueryExpression("context node missing from snapshot".to_string()))?;

    let results = query
        .execute(&mut documents, snapshot_context)
        .map_err(|e: xee_xpath::error::Error| Error::QueryExpression(e.to_string()))?;

    let mut found: Vec<(OrderKey, Slot)> = Vec::new();
    for item in results.iter() {
        match item {
            Item::Node(node) => found.push(locate(store, documents.xot(), node)?),
            Item::Atomic(_) | Item::Function(_) => {
                return Err(Error::QueryExpression(format!(
                    "`{}` must select nodes, but returned a non-node item",
                    xpath
                )))
            }
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    found.dedup_by(|a, b| a.0 == b.0);
    Ok(found.into_iter().map(|(_, slot)| slot).collect())
}

/// Child indexes leading from the root to `node`
fn child_path(xot: &Xot, node: Node) -> Vec<usize> {
    let mut path = Vec::new();
    let mut current = node;
    while let Some(parent) = xot.parent(current) {
        let index = xot.children(parent).position(|c| c == current).unwrap_or(0);
        path.push(index);
        current = parent;
    }
    path.reverse();
    path
}

fn node_at(xot: &Xot, root: Node, path: &[usize]) -> Option<Node> {
    path.iter()
        .try_fold(root, |node, &index| xot.children(node).nth(index))
}

/// Map a snapshot node onto the live tree
fn locate(store: &TreeStore, snapshot: &Xot, node: Node) -> Result<(OrderKey, Slot)> {
    let unmapped = || Error::QueryExpression("query result has no counterpart in the document".to_string());
    let live = store.xot();

    match snapshot.value(node) {
        Value::Attribute(attribute) => {
            let owner = snapshot.parent(node).ok_or_else(unmapped)?;
            let path = child_path(snapshot, owner);
            let element = node_at(live, store.root(), &path).ok_or_else(unmapped)?;
            let (local, uri) = snapshot.name_ns_str(attribute.name());
            let name = store.find_attribute_ns(element, local, uri).ok_or_else(unmapped)?;
            let position = store
                .attribute_ids(element)
                .iter()
                .position(|&n| n == name)
                .unwrap_or(0);
            Ok(((path, 2, position), Slot::Attribute(element, name)))
        }
        Value::Namespace(namespace) => {
            let owner = snapshot.parent(node).ok_or_else(unmapped)?;
            let path = child_path(snapshot, owner);
            let element = node_at(live, store.root(), &path).ok_or_else(unmapped)?;
            let wanted = snapshot.prefix_str(namespace.prefix());
            let (position, prefix) = live
                .namespaces(element)
                .iter()
                .enumerate()
                .find(|(_, (prefix, _))| live.prefix_str(*prefix) == wanted)
                .map(|(i, (prefix, _))| (i, prefix))
                .ok_or_else(unmapped)?;
            Ok(((path, 1, position), Slot::Namespace(element, prefix)))
        }
        _ => {
            let path = child_path(snapshot, node);
            let target = node_at(live, store.root(), &path).ok_or_else(unmapped)?;
            Ok(((path, 0, 0), Slot::Node(target)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    #[test]
    fn test_results_in_document_order() {
        let doc = Document::parse("<a><b id=\"1\"/><c/><b id=\"2\"/></a>").unwrap();
        let found = QueryEngine::new()
            .evaluate(&doc.root(), "(//b[@id='2'], //c, //b[@id='1'], //c)")
            .unwrap();
        let tags: Vec<String> = found.iter().map(|n| n.tag().unwrap().unwrap()).collect();
        assert_eq!(tags, vec!["b", "c", "b"]);
        assert_eq!(found[0].attribute("id").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_attribute_results_follow_owner() {
        let doc = Document::parse("<a x=\"1\"><b y=\"2\"/></a>").unwrap();
        let found = QueryEngine::new().evaluate(&doc.root(), "//@*").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].text().unwrap(), "1");
        assert_eq!(found[1].text().unwrap(), "2");
    }

    #[test]
    fn test_atomic_result_is_an_error() {
        let doc = Document::parse("<a/>").unwrap();
        let err = QueryEngine::new().evaluate(&doc.root(), "count(//a)").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::QueryExpression);
    }

    #[test]
    fn test_engine_namespace_binding() {
        let doc = Document::parse(r#"<r xmlns:p="urn:p"><p:a/><a/></r>"#).unwrap();
        let engine = QueryEngine::new().with_namespace("q", "urn:p");
        let found = engine.evaluate(&doc.root(), "//q:a").unwrap();
        assert_eq!(found.len(), 1);

        let err = QueryEngine::new().evaluate(&doc.root(), "//q:a").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::QueryExpression);
    }

    #[test]
    fn test_child_path_roundtrip() {
        let mut xot = Xot::new();
        let root = xot.parse("<a><b/><c><d/></c></a>").unwrap();
        let a = xot.document_element(root).unwrap();
        let c = xot.last_child(a).unwrap();
        let d = xot.first_child(c).unwrap();
        let path = child_path(&xot, d);
        assert_eq!(path, vec![0, 1, 0]);
        assert_eq!(node_at(&xot, root, &path), Some(d));
    }
}
