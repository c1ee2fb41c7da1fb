//! Tree store: the xot arena owned by a document, plus the bookkeeping the
//! handle layer needs on top of it.
//!
//! On top of the arena the store tracks:
//! - a generation counter, bumped on every mutation
//! - retired nodes (text merged away), which every handle must reject
//! - detached subtree roots, kept alive until the document is dropped
//! - the unique-key table and a name cache

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use xot::{NameId, Node, PrefixId, Value, Xot};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handle::NodeKind;
use crate::query::NamespaceBindings;
use crate::serial::SerializeOptions;

static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

/// A tree position a handle can name.
///
/// Attribute and namespace nodes are addressed through their owner element
/// so that renaming or removing them never leaves a dangling arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Slot {
    Node(Node),
    Attribute(Node, NameId),
    Namespace(Node, PrefixId),
}

impl Slot {
    /// The arena node that owns this slot
    pub(crate) fn owner(self) -> Node {
        match self {
            Slot::Node(node) | Slot::Attribute(node, _) | Slot::Namespace(node, _) => node,
        }
    }
}

/// Stable identity of a node: equal iff both keys name the same node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    document: u64,
    node: u64,
}

impl NodeKey {
    pub fn document(&self) -> u64 {
        self.document
    }

    pub fn node(&self) -> u64 {
        self.node
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}:n{}", self.document, self.node)
    }
}

pub(crate) struct TreeStore {
    xot: Xot,
    root: Node,
    uri: String,
    id: u64,
    generation: u64,
    keys: HashMap<Slot, u64>,
    next_key: u64,
    retired: HashSet<Node>,
    detached: Vec<Node>,
    /// Cache of (local name, namespace uri) to NameIds
    name_cache: HashMap<(String, String), NameId>,
    pub(crate) bindings: NamespaceBindings,
    pub(crate) serialize_options: SerializeOptions,
}

impl TreeStore {
    pub(crate) fn load(xml: &str, config: &Config) -> Result<Self> {
        let mut xot = Xot::new();
        let root = xot
            .parse(xml)
            .map_err(|e| Error::DocumentParse(e.to_string()))?;

        Ok(TreeStore {
            xot,
            root,
            uri: config.document_uri.clone(),
            id: NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            keys: HashMap::new(),
            next_key: 1,
            retired: HashSet::new(),
            detached: Vec::new(),
            name_cache: HashMap::new(),
            bindings: config.namespaces.clone(),
            serialize_options: config.serialize.clone(),
        })
    }

    pub(crate) fn xot(&self) -> &Xot {
        &self.xot
    }

    pub(crate) fn xot_mut(&mut self) -> &mut Xot {
        &mut self.xot
    }

    /// URI the query engine registers snapshots of this tree under
    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn root(&self) -> Node {
        self.root
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Record a mutation; every cached attachment check becomes void
    pub(crate) fn bump(&mut self, reason: &str) {
        self.generation += 1;
        tracing::trace!("generation {} after {}", self.generation, reason);
    }

    pub(crate) fn key_for(&mut self, slot: Slot) -> NodeKey {
        let next = &mut self.next_key;
        let node = *self.keys.entry(slot).or_insert_with(|| {
            let key = *next;
            *next += 1;
            key
        });
        NodeKey {
            document: self.id,
            node,
        }
    }

    pub(crate) fn is_retired(&self, node: Node) -> bool {
        self.retired.contains(&node)
    }

    pub(crate) fn detached_count(&self) -> usize {
        self.detached.len()
    }

    // =========================================================================
    // Slot validation
    // =========================================================================

    /// Whether the slot still names something readable
    pub(crate) fn slot_exists(&self, slot: Slot) -> bool {
        if self.is_retired(slot.owner()) {
            return false;
        }
        match slot {
            Slot::Node(_) => true,
            Slot::Attribute(element, name) => self.attribute_value(element, name).is_some(),
            Slot::Namespace(element, prefix) => self.declared_namespace(element, prefix).is_some(),
        }
    }

    /// Whether the slot is reachable from the document root
    pub(crate) fn is_attached(&self, slot: Slot) -> bool {
        self.slot_exists(slot) && self.top(slot.owner()) == self.root
    }

    /// Topmost ancestor of a node (the node itself when it has no parent)
    pub(crate) fn top(&self, node: Node) -> Node {
        let xot = self.xot();
        let mut current = node;
        while let Some(parent) = xot.parent(current) {
            current = parent;
        }
        current
    }

    pub(crate) fn is_ancestor_or_self(&self, ancestor: Node, node: Node) -> bool {
        let xot = self.xot();
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = xot.parent(n);
        }
        false
    }

    pub(crate) fn kind(&self, slot: Slot) -> NodeKind {
        match slot {
            Slot::Attribute(..) => NodeKind::Attribute,
            Slot::Namespace(..) => NodeKind::Namespace,
            Slot::Node(node) => match self.xot().value(node) {
                Value::Document => NodeKind::Document,
                Value::Element(_) => NodeKind::Element,
                Value::Text(_) => NodeKind::Text,
                Value::Comment(_) => NodeKind::Comment,
                Value::ProcessingInstruction(_) => NodeKind::ProcessingInstruction,
                Value::Attribute(_) => NodeKind::Attribute,
                Value::Namespace(_) => NodeKind::Namespace,
            },
        }
    }

    // =========================================================================
    // Names
    // =========================================================================

    /// Get or create a NameId for a local name in a namespace ("" for none)
    pub(crate) fn name_id(&mut self, local: &str, namespace: &str) -> NameId {
        let key = (local.to_string(), namespace.to_string());
        if let Some(&id) = self.name_cache.get(&key) {
            return id;
        }
        let xot = self.xot_mut();
        let id = if namespace.is_empty() {
            xot.add_name(local)
        } else {
            let ns = xot.add_namespace(namespace);
            xot.add_name_ns(local, ns)
        };
        self.name_cache.insert(key, id);
        id
    }

    /// (local name, namespace uri) of a name id
    pub(crate) fn name_parts(&self, name: NameId) -> (String, String) {
        let (local, uri) = self.xot().name_ns_str(name);
        (local.to_string(), uri.to_string())
    }

    /// Local name of an element node
    pub(crate) fn element_name(&self, node: Node) -> Option<String> {
        self.xot()
            .element(node)
            .map(|element| self.xot().local_name_str(element.name()).to_string())
    }

    // =========================================================================
    // Attributes and namespace declarations
    // =========================================================================

    pub(crate) fn attribute_value(&self, element: Node, name: NameId) -> Option<String> {
        if self.xot().element(element).is_none() {
            return None;
        }
        self.xot()
            .attributes(element)
            .iter()
            .find(|(attr_name, _)| *attr_name == name)
            .map(|(_, value)| value.to_string())
    }

    /// Attribute names in document order
    pub(crate) fn attribute_ids(&self, element: Node) -> Vec<NameId> {
        if self.xot().element(element).is_none() {
            return Vec::new();
        }
        self.xot()
            .attributes(element)
            .iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Find an attribute by local name, preferring the one without namespace
    pub(crate) fn find_attribute(&self, element: Node, local: &str) -> Option<NameId> {
        let candidates: Vec<NameId> = self
            .attribute_ids(element)
            .into_iter()
            .filter(|&name| self.xot().local_name_str(name) == local)
            .collect();
        candidates
            .iter()
            .copied()
            .find(|&name| self.name_parts(name).1.is_empty())
            .or_else(|| candidates.first().copied())
    }

    pub(crate) fn find_attribute_ns(&self, element: Node, local: &str, namespace: &str) -> Option<NameId> {
        self.attribute_ids(element).into_iter().find(|&name| {
            let (attr_local, attr_ns) = self.name_parts(name);
            attr_local == local && attr_ns == namespace
        })
    }

    pub(crate) fn declared_namespace(&self, element: Node, prefix: PrefixId) -> Option<String> {
        if self.xot().element(element).is_none() {
            return None;
        }
        self.xot()
            .namespaces(element)
            .iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, ns)| self.xot().namespace_str(*ns).to_string())
    }

    /// Namespace declarations made on an element, as (prefix, uri)
    pub(crate) fn declarations(&self, element: Node) -> Vec<(String, String)> {
        if self.xot().element(element).is_none() {
            return Vec::new();
        }
        let xot = self.xot();
        xot.namespaces(element)
            .iter()
            .map(|(prefix, ns)| (xot.prefix_str(prefix).to_string(), xot.namespace_str(*ns).to_string()))
            .collect()
    }

    /// Bindings visible at `node` (nearest declaration wins), outermost first
    pub(crate) fn in_scope_namespaces(&self, node: Node) -> Vec<(String, String)> {
        let xot = self.xot();
        let mut seen = HashSet::new();
        let mut scope = Vec::new();
        let mut current = Some(node);
        while let Some(n) = current {
            for (prefix, uri) in self.declarations(n) {
                if seen.insert(prefix.clone()) {
                    scope.push((prefix, uri));
                }
            }
            current = xot.parent(n);
        }
        scope.reverse();
        scope
    }

    /// Non-empty prefix bound to `uri` at `node`, if any
    pub(crate) fn prefix_for_uri(&self, node: Node, uri: &str) -> Option<String> {
        self.in_scope_namespaces(node)
            .into_iter()
            .rev()
            .find(|(prefix, bound)| !prefix.is_empty() && bound == uri)
            .map(|(prefix, _)| prefix)
    }

    pub(crate) fn uri_for_prefix(&self, node: Node, prefix: &str) -> Option<String> {
        self.in_scope_namespaces(node)
            .into_iter()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri)
    }

    // =========================================================================
    // Structure
    // =========================================================================

    /// Detach a subtree, keeping adjacent text siblings consolidated.
    ///
    /// When `node` sits between two text nodes their content is joined into
    /// one of them and the other is retired, so xot never has to merge text
    /// itself. The earlier text survives unless `keep` names the later one.
    /// Returns `(retired, survivor)` when a merge happened.
    pub(crate) fn detach(&mut self, node: Node, keep: Option<Node>) -> Result<Option<(Node, Node)>> {
        let (prev, next) = {
            let xot = self.xot();
            (xot.previous_sibling(node), xot.next_sibling(node))
        };
        let mut merged = None;
        if let (Some(prev), Some(next)) = (prev, next) {
            let joined = match (self.xot().text_str(prev), self.xot().text_str(next)) {
                (Some(a), Some(b)) => Some(format!("{}{}", a, b)),
                _ => None,
            };
            if let Some(joined) = joined {
                let (survivor, retired) = if keep == Some(next) { (next, prev) } else { (prev, next) };
                self.detach_raw(retired)?;
                self.retired.insert(retired);
                if let Some(text) = self.xot_mut().text_mut(survivor) {
                    text.set(joined);
                }
                tracing::trace!("merged text siblings around a detached node");
                merged = Some((retired, survivor));
            }
        }
        self.detach_raw(node)?;
        Ok(merged)
    }

    /// Detach without text consolidation; callers guarantee no two text
    /// nodes become adjacent
    pub(crate) fn detach_raw(&mut self, node: Node) -> Result<()> {
        let kind = self.kind(Slot::Node(node));
        self.xot_mut()
            .detach(node)
            .map_err(|e| Error::invalid(kind, e.to_string()))?;
        self.detached.push(node);
        Ok(())
    }

    /// Retire a parentless node whose content was merged elsewhere
    pub(crate) fn retire(&mut self, node: Node) {
        self.retired.insert(node);
        self.detached.push(node);
    }

    /// Keep a parentless node that was created but never inserted
    pub(crate) fn discard(&mut self, node: Node) {
        self.detached.push(node);
    }

    /// Declare `prefix` → `uri` on an element
    pub(crate) fn declare_namespace(&mut self, element: Node, prefix: &str, uri: &str) {
        let xot = self.xot_mut();
        let prefix_id = xot.add_prefix(prefix);
        let namespace_id = xot.add_namespace(uri);
        xot.namespaces_mut(element).insert(prefix_id, namespace_id);
        tracing::trace!("declared xmlns:{}=\"{}\"", prefix, uri);
    }

    /// First `ns<N>` prefix not bound at `node`
    pub(crate) fn fresh_prefix(&self, node: Node) -> String {
        let scope = self.in_scope_namespaces(node);
        let mut index = 0;
        loop {
            let candidate = format!("ns{}", index);
            if scope.iter().all(|(prefix, _)| *prefix != candidate) {
                return candidate;
            }
            index += 1;
        }
    }

    /// Merge `text` into an existing text node (appending or prepending)
    pub(crate) fn merge_text(&mut self, target: Node, text: &str, prepend: bool) {
        if let Some(existing) = self.xot_mut().text_mut(target) {
            let merged = if prepend {
                format!("{}{}", text, existing.get())
            } else {
                format!("{}{}", existing.get(), text)
            };
            existing.set(merged);
            tracing::trace!("merged inserted text into an existing text node");
        }
    }
}

/// Split `prefix:local` into its parts
pub(crate) fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(xml: &str) -> TreeStore {
        TreeStore::load(xml, &Config::default()).unwrap()
    }

    #[test]
    fn test_keys_are_stable_and_distinct() {
        let mut store = load("<a><b/><c/></a>");
        let a = store.xot().document_element(store.root()).unwrap();
        let b = store.xot().first_child(a).unwrap();
        let c = store.xot().next_sibling(b).unwrap();

        let kb = store.key_for(Slot::Node(b));
        assert_eq!(kb, store.key_for(Slot::Node(b)));
        assert_ne!(kb, store.key_for(Slot::Node(c)));
        assert_eq!(kb.document(), store.id());
    }

    #[test]
    fn test_documents_get_distinct_ids() {
        let one = load("<a/>");
        let two = load("<a/>");
        assert_ne!(one.id(), two.id());
    }

    #[test]
    fn test_attachment_follows_detach() {
        let mut store = load("<a><b><c/></b></a>");
        let a = store.xot().document_element(store.root()).unwrap();
        let b = store.xot().first_child(a).unwrap();
        let c = store.xot().first_child(b).unwrap();
        assert!(store.is_attached(Slot::Node(c)));

        assert_eq!(store.detach(b, None).unwrap(), None);
        assert!(!store.is_attached(Slot::Node(b)));
        assert!(!store.is_attached(Slot::Node(c)));
        assert!(store.slot_exists(Slot::Node(c)));
        assert_eq!(store.detached_count(), 1);
    }

    #[test]
    fn test_detach_merges_surrounding_text() {
        let mut store = load("<a>one<b/>two</a>");
        let a = store.xot().document_element(store.root()).unwrap();
        let first = store.xot().first_child(a).unwrap();
        let b = store.xot().next_sibling(first).unwrap();
        let second = store.xot().next_sibling(b).unwrap();

        assert_eq!(store.detach(b, None).unwrap(), Some((second, first)));
        assert_eq!(store.xot().text_str(first), Some("onetwo"));
        assert!(store.is_retired(second));
        assert!(!store.slot_exists(Slot::Node(second)));
        assert_eq!(store.xot().children(a).count(), 1);
    }

    #[test]
    fn test_detach_can_keep_later_text() {
        let mut store = load("<a>one<b/>two</a>");
        let a = store.xot().document_element(store.root()).unwrap();
        let first = store.xot().first_child(a).unwrap();
        let b = store.xot().next_sibling(first).unwrap();
        let second = store.xot().next_sibling(b).unwrap();

        assert_eq!(store.detach(b, Some(second)).unwrap(), Some((first, second)));
        assert_eq!(store.xot().text_str(second), Some("onetwo"));
        assert!(store.is_retired(first));
    }

    #[test]
    fn test_in_scope_namespaces_nearest_wins() {
        let store = load(r#"<a xmlns:p="urn:outer"><b xmlns:p="urn:inner" xmlns:q="urn:q"/></a>"#);
        let a = store.xot().document_element(store.root()).unwrap();
        let b = store.xot().first_child(a).unwrap();

        assert_eq!(store.uri_for_prefix(b, "p").as_deref(), Some("urn:inner"));
        assert_eq!(store.prefix_for_uri(b, "urn:q").as_deref(), Some("q"));
        assert_eq!(store.prefix_for_uri(b, "urn:outer"), None);
        assert_eq!(store.prefix_for_uri(a, "urn:outer").as_deref(), Some("p"));
    }

    #[test]
    fn test_find_attribute_prefers_no_namespace() {
        let store = load(r#"<a xmlns:x="urn:x" x:id="ns" id="plain"/>"#);
        let a = store.xot().document_element(store.root()).unwrap();
        let name = store.find_attribute(a, "id").unwrap();
        assert_eq!(store.attribute_value(a, name).as_deref(), Some("plain"));

        let ns_name = store.find_attribute_ns(a, "id", "urn:x").unwrap();
        assert_eq!(store.attribute_value(a, ns_name).as_deref(), Some("ns"));
    }

    #[test]
    fn test_split_qname() {
        assert_eq!(split_qname("x:id"), (Some("x"), "id"));
        assert_eq!(split_qname("id"), (None, "id"));
    }
}
