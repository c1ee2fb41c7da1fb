//! Node handles
//!
//! A [`NodeHandle`] names one position in a document's tree. Handles are
//! cheap to create and re-create: two handles obtained independently for the
//! same node compare equal and report the same [`NodeKey`].
//!
//! Handles never keep their document alive. Structural operations verify
//! that the node is still attached to the document (cached per generation);
//! reads also work on removed-but-unreclaimed subtrees.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use once_cell::sync::Lazy;
use regex::Regex;
use strum_macros::{AsRefStr, Display};
use xot::Node;

use crate::error::{Error, Result};
use crate::node_set::NodeSet;
use crate::serial::{self, SerializeOptions};
use crate::store::{split_qname, NodeKey, Slot, TreeStore};

static XML_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\p{L}_][\p{L}\p{N}_.\-]*$").unwrap());

pub(crate) const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Kind of the node a handle points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    Document,
    Element,
    Text,
    Comment,
    ProcessingInstruction,
    Attribute,
    Namespace,
}

/// Handle to a node (or attribute / namespace declaration) in a [`Document`](crate::Document)
pub struct NodeHandle {
    store: Weak<RefCell<TreeStore>>,
    slot: Slot,
    /// Generation at which attachment was last verified
    verified: Cell<Option<u64>>,
    last_error: RefCell<Option<Error>>,
}

impl NodeHandle {
    pub(crate) fn new(store: &Rc<RefCell<TreeStore>>, slot: Slot) -> Self {
        NodeHandle {
            store: Rc::downgrade(store),
            slot,
            verified: Cell::new(None),
            last_error: RefCell::new(None),
        }
    }

    pub(crate) fn slot(&self) -> Slot {
        self.slot
    }

    pub(crate) fn belongs_to(&self, store: &Rc<RefCell<TreeStore>>) -> bool {
        std::ptr::eq(self.store.as_ptr(), Rc::as_ptr(store))
    }

    pub(crate) fn upgrade(&self) -> Result<Rc<RefCell<TreeStore>>> {
        self.store
            .upgrade()
            .ok_or_else(|| Error::stale("the document has been dropped"))
    }

    /// Store for read access: the slot must still exist
    pub(crate) fn readable(&self) -> Result<Rc<RefCell<TreeStore>>> {
        let store = self.upgrade()?;
        if !store.borrow().slot_exists(self.slot) {
            return Err(Error::stale(match self.slot {
                Slot::Node(_) => "node was merged into a neighbouring text node",
                Slot::Attribute(..) => "attribute no longer exists",
                Slot::Namespace(..) => "namespace declaration no longer exists",
            }));
        }
        Ok(store)
    }

    /// Store for structural access: the node must be attached to the document
    pub(crate) fn attached(&self) -> Result<Rc<RefCell<TreeStore>>> {
        let store = self.readable()?;
        {
            let tree = store.borrow();
            let generation = tree.generation();
            if self.verified.get() != Some(generation) {
                if !tree.is_attached(self.slot) {
                    return Err(Error::stale("node is no longer attached to its document"));
                }
                self.verified.set(Some(generation));
            }
        }
        Ok(store)
    }

    /// Record the outcome of a fallible operation in `last_error`
    pub(crate) fn track<T>(&self, result: Result<T>) -> Result<T> {
        *self.last_error.borrow_mut() = result.as_ref().err().cloned();
        result
    }

    fn read<T>(&self, f: impl FnOnce(&TreeStore) -> Result<T>) -> Result<T> {
        let result = self.readable().and_then(|store| {
            let tree = store.borrow();
            f(&tree)
        });
        self.track(result)
    }

    fn structural<T>(&self, f: impl FnOnce(&Rc<RefCell<TreeStore>>) -> Result<T>) -> Result<T> {
        let result = self.attached().and_then(|store| f(&store));
        self.track(result)
    }

    fn handle(&self, store: &Rc<RefCell<TreeStore>>, node: Node) -> NodeHandle {
        NodeHandle::new(store, Slot::Node(node))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn kind(&self) -> Result<NodeKind> {
        self.read(|tree| Ok(tree.kind(self.slot)))
    }

    /// Local name of an element; `None` for every other kind
    pub fn tag(&self) -> Result<Option<String>> {
        self.read(|tree| match self.slot {
            Slot::Node(node) => Ok(tree.element_name(node)),
            _ => Ok(None),
        })
    }

    /// String value: descendant text for elements and documents, own content
    /// for text, comments and processing instructions, the value of an
    /// attribute, the URI of a namespace declaration
    pub fn text(&self) -> Result<String> {
        self.read(|tree| match self.slot {
            Slot::Node(node) => Ok(tree.xot().string_value(node)),
            Slot::Attribute(element, name) => Ok(tree.attribute_value(element, name).unwrap_or_default()),
            Slot::Namespace(element, prefix) => Ok(tree.declared_namespace(element, prefix).unwrap_or_default()),
        })
    }

    /// Markup of this node and its descendants
    pub fn xml(&self) -> Result<String> {
        self.xml_with(&SerializeOptions::default())
    }

    pub fn xml_with(&self, options: &SerializeOptions) -> Result<String> {
        self.read(|tree| serial::render(tree, self.slot, options, false))
    }

    /// Markup of the children only
    pub fn inner_xml(&self) -> Result<String> {
        self.inner_xml_with(&SerializeOptions::default())
    }

    pub fn inner_xml_with(&self, options: &SerializeOptions) -> Result<String> {
        self.read(|tree| serial::render(tree, self.slot, options, true))
    }

    /// Attribute value by name.
    ///
    /// A plain name prefers the attribute without namespace, then any
    /// attribute with that local name. `prefix:local` resolves the prefix in
    /// scope of the element.
    pub fn attribute(&self, name: &str) -> Result<Option<String>> {
        self.read(|tree| {
            let Slot::Node(node) = self.slot else {
                return Ok(None);
            };
            let found = match split_qname(name) {
                (Some(prefix), local) => resolve_prefix(tree, node, prefix)
                    .and_then(|uri| tree.find_attribute_ns(node, local, &uri)),
                (None, local) => tree.find_attribute(node, local),
            };
            Ok(found.and_then(|id| tree.attribute_value(node, id)))
        })
    }

    /// Attribute value by local name and namespace URI
    pub fn attribute_ns(&self, name: &str, uri: &str) -> Result<Option<String>> {
        self.read(|tree| {
            let Slot::Node(node) = self.slot else {
                return Ok(None);
            };
            let (_, local) = split_qname(name);
            Ok(tree
                .find_attribute_ns(node, local, uri)
                .and_then(|id| tree.attribute_value(node, id)))
        })
    }

    /// Local names of all attributes, document order
    pub fn attribute_names(&self) -> Result<Vec<String>> {
        self.read(|tree| {
            let Slot::Node(node) = self.slot else {
                return Ok(Vec::new());
            };
            Ok(tree
                .attribute_ids(node)
                .into_iter()
                .map(|id| tree.name_parts(id).0)
                .collect())
        })
    }

    /// Keyed access, same as [`NodeHandle::attribute`]
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.attribute(key)
    }

    /// Keyed assignment, same as [`NodeHandle::set_attribute`]
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_attribute(key, value)
    }

    pub fn unique_key(&self) -> Result<NodeKey> {
        let result = self.key();
        self.track(result)
    }

    /// Key lookup that leaves `last_error` alone
    pub(crate) fn key(&self) -> Result<NodeKey> {
        let store = self.readable()?;
        let key = store.borrow_mut().key_for(self.slot);
        Ok(key)
    }

    pub fn is_same_node(&self, other: &NodeHandle) -> bool {
        self == other
    }

    /// Error of the most recent failed operation on this handle instance
    pub fn last_error(&self) -> Option<Error> {
        self.last_error.borrow().clone()
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    pub fn parent(&self) -> Result<Option<NodeHandle>> {
        self.structural(|store| {
            let parent = match self.slot {
                Slot::Node(node) => store.borrow().xot().parent(node),
                Slot::Attribute(element, _) | Slot::Namespace(element, _) => Some(element),
            };
            Ok(parent.map(|node| self.handle(store, node)))
        })
    }

    pub fn next_sibling(&self) -> Result<Option<NodeHandle>> {
        self.sibling(|tree, node| tree.xot().next_sibling(node), false)
    }

    pub fn previous_sibling(&self) -> Result<Option<NodeHandle>> {
        self.sibling(|tree, node| tree.xot().previous_sibling(node), false)
    }

    pub fn next_element_sibling(&self) -> Result<Option<NodeHandle>> {
        self.sibling(|tree, node| tree.xot().next_sibling(node), true)
    }

    pub fn previous_element_sibling(&self) -> Result<Option<NodeHandle>> {
        self.sibling(|tree, node| tree.xot().previous_sibling(node), true)
    }

    fn sibling(&self, step: impl Fn(&TreeStore, Node) -> Option<Node>, elements_only: bool) -> Result<Option<NodeHandle>> {
        self.structural(|store| {
            let Slot::Node(node) = self.slot else {
                return Ok(None);
            };
            let tree = store.borrow();
            let mut current = step(&tree, node);
            while let Some(candidate) = current {
                if !elements_only || tree.xot().element(candidate).is_some() {
                    break;
                }
                current = step(&tree, candidate);
            }
            Ok(current.map(|node| self.handle(store, node)))
        })
    }

    /// First element child
    pub fn first_child(&self) -> Result<Option<NodeHandle>> {
        self.structural(|store| {
            let Slot::Node(node) = self.slot else {
                return Ok(None);
            };
            let tree = store.borrow();
            let xot = tree.xot();
            let first = xot.children(node).find(|&child| xot.element(child).is_some());
            Ok(first.map(|child| self.handle(store, child)))
        })
    }

    /// Element children in document order
    pub fn children(&self) -> Result<NodeSet> {
        self.structural(|store| {
            let Slot::Node(node) = self.slot else {
                return Ok(NodeSet::new());
            };
            let tree = store.borrow();
            let xot = tree.xot();
            let children: NodeSet = xot
                .children(node)
                .filter(|&child| xot.element(child).is_some())
                .map(|child| self.handle(store, child))
                .collect();
            Ok(children)
        })
    }

    // =========================================================================
    // Element mutation
    // =========================================================================

    /// Rename an element in place; `prefix:local` resolves the prefix in scope
    pub fn set_tag(&self, name: &str) -> Result<()> {
        self.structural(|store| {
            let mut tree = store.borrow_mut();
            let node = require_element(&tree, self.slot, "rename")?;
            let (prefix, local) = split_qname(name);
            check_name(name, local)?;
            let uri = match prefix {
                Some(prefix) => resolve_prefix(&tree, node, prefix).ok_or_else(|| unbound(prefix))?,
                None => {
                    let current = tree.xot().element(node).map(|e| e.name());
                    current.map(|id| tree.name_parts(id).1).unwrap_or_default()
                }
            };
            if let Some(prefix) = prefix {
                if tree.uri_for_prefix(node, prefix).as_deref() != Some(uri.as_str()) {
                    tree.declare_namespace(node, prefix, &uri);
                }
            }
            let id = tree.name_id(local, &uri);
            if let Some(element) = tree.xot_mut().element_mut(node) {
                element.set_name(id);
            }
            tree.bump("set_tag");
            tracing::debug!("renamed element to `{}`", name);
            Ok(())
        })
    }

    /// Create or overwrite an attribute
    pub fn set_attribute(&self, name: &str, value: &str) -> Result<()> {
        self.structural(|store| {
            let mut tree = store.borrow_mut();
            let node = require_element(&tree, self.slot, "set an attribute on")?;
            let (prefix, local) = split_qname(name);
            check_name(name, local)?;
            let uri = match prefix {
                Some(prefix) => {
                    let uri = resolve_prefix(&tree, node, prefix).ok_or_else(|| unbound(prefix))?;
                    if uri != XML_NAMESPACE && tree.uri_for_prefix(node, prefix).as_deref() != Some(uri.as_str()) {
                        tree.declare_namespace(node, prefix, &uri);
                    }
                    uri
                }
                None => String::new(),
            };
            let id = tree.name_id(local, &uri);
            tree.xot_mut().attributes_mut(node).insert(id, value.to_string());
            tree.bump("set_attribute");
            Ok(())
        })
    }

    /// Create or overwrite an attribute in namespace `uri`, declaring a
    /// prefix on the element when none is in scope
    pub fn set_attribute_ns(&self, name: &str, uri: &str, value: &str) -> Result<()> {
        self.structural(|store| {
            let mut tree = store.borrow_mut();
            let node = require_element(&tree, self.slot, "set an attribute on")?;
            let (hint, local) = split_qname(name);
            check_name(name, local)?;
            if !uri.is_empty() && uri != XML_NAMESPACE && tree.prefix_for_uri(node, uri).is_none() {
                let prefix = match hint {
                    Some(hint) if hint != "xml" && tree.uri_for_prefix(node, hint).is_none() => hint.to_string(),
                    _ => tree.fresh_prefix(node),
                };
                tree.declare_namespace(node, &prefix, uri);
            }
            let id = tree.name_id(local, uri);
            tree.xot_mut().attributes_mut(node).insert(id, value.to_string());
            tree.bump("set_attribute_ns");
            Ok(())
        })
    }

    /// Remove an attribute by name; absent attributes are ignored
    pub fn remove_attribute(&self, name: &str) -> Result<()> {
        self.structural(|store| {
            let mut tree = store.borrow_mut();
            let node = require_element(&tree, self.slot, "remove an attribute from")?;
            let found = match split_qname(name) {
                (Some(prefix), local) => resolve_prefix(&tree, node, prefix)
                    .and_then(|uri| tree.find_attribute_ns(node, local, &uri)),
                (None, local) => tree.find_attribute(node, local),
            };
            if let Some(id) = found {
                tree.xot_mut().attributes_mut(node).remove(id);
                tree.bump("remove_attribute");
            }
            Ok(())
        })
    }

    pub fn remove_attribute_ns(&self, name: &str, uri: &str) -> Result<()> {
        self.structural(|store| {
            let mut tree = store.borrow_mut();
            let node = require_element(&tree, self.slot, "remove an attribute from")?;
            let (_, local) = split_qname(name);
            if let Some(id) = tree.find_attribute_ns(node, local, uri) {
                tree.xot_mut().attributes_mut(node).remove(id);
                tree.bump("remove_attribute_ns");
            }
            Ok(())
        })
    }
}

/// Namespace URI for `prefix` at `node`: in-scope declarations first, then
/// the document's registered bindings
pub(crate) fn resolve_prefix(tree: &TreeStore, node: Node, prefix: &str) -> Option<String> {
    if prefix == "xml" {
        return Some(XML_NAMESPACE.to_string());
    }
    tree.uri_for_prefix(node, prefix)
        .or_else(|| tree.bindings.get(prefix).map(str::to_string))
}

fn require_element(tree: &TreeStore, slot: Slot, action: &str) -> Result<Node> {
    match slot {
        Slot::Node(node) if tree.xot().element(node).is_some() => Ok(node),
        other => Err(Error::invalid(tree.kind(other), format!("cannot {} a non-element", action))),
    }
}

fn check_name(name: &str, local: &str) -> Result<()> {
    if XML_NAME_RE.is_match(local) {
        Ok(())
    } else {
        Err(Error::invalid(NodeKind::Element, format!("`{}` is not a valid XML name", name)))
    }
}

fn unbound(prefix: &str) -> Error {
    Error::invalid(NodeKind::Element, format!("namespace prefix `{}` is not bound", prefix))
}

impl Clone for NodeHandle {
    /// A clone names the same node; `last_error` starts empty
    fn clone(&self) -> Self {
        NodeHandle {
            store: self.store.clone(),
            slot: self.slot,
            verified: Cell::new(self.verified.get()),
            last_error: RefCell::new(None),
        }
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.store, &other.store) && self.slot == other.slot
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.store.as_ptr() as *const () as usize).hash(state);
        self.slot.hash(state);
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("NodeHandle");
        debug.field("slot", &self.slot);
        if let Ok(store) = self.readable() {
            let kind = store.borrow().kind(self.slot);
            debug.field("kind", &kind);
        }
        debug.finish()
    }
}
