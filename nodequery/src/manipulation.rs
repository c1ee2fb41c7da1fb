//! Tree manipulation: grafting content, removal, namespace stripping
//!
//! Every insertion validates the whole request before the tree is touched.
//! Markup is parsed as a fragment up front, so a parse failure leaves the
//! document unchanged. Text is merged by hand at the insertion boundaries;
//! the tree never holds two adjacent text nodes.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::rc::Rc;

use quick_xml::escape::escape;
use xot::{Node, Value};

use crate::error::{Error, Result};
use crate::handle::{NodeHandle, NodeKind};
use crate::node_set::NodeSet;
use crate::store::{Slot, TreeStore};

const FRAGMENT_WRAPPER: &str = "nq-fragment";

/// Where inserted content goes, relative to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Last children of the target
    Append,
    /// First children of the target
    Prepend,
    /// Previous siblings of the target
    Before,
    /// Next siblings of the target
    After,
}

/// Content to insert: markup parsed as a fragment, or existing nodes
#[derive(Debug, Clone)]
pub enum Content {
    Markup(String),
    Nodes(Vec<NodeHandle>),
}

impl From<&str> for Content {
    fn from(markup: &str) -> Self {
        Content::Markup(markup.to_string())
    }
}

impl From<String> for Content {
    fn from(markup: String) -> Self {
        Content::Markup(markup)
    }
}

impl From<&String> for Content {
    fn from(markup: &String) -> Self {
        Content::Markup(markup.clone())
    }
}

impl From<NodeHandle> for Content {
    fn from(node: NodeHandle) -> Self {
        Content::Nodes(vec![node])
    }
}

impl From<&NodeHandle> for Content {
    fn from(node: &NodeHandle) -> Self {
        Content::Nodes(vec![node.clone()])
    }
}

impl From<NodeSet> for Content {
    fn from(nodes: NodeSet) -> Self {
        Content::Nodes(nodes.into_vec())
    }
}

impl From<&NodeSet> for Content {
    fn from(nodes: &NodeSet) -> Self {
        Content::Nodes(nodes.iter().cloned().collect())
    }
}

impl From<Vec<NodeHandle>> for Content {
    fn from(nodes: Vec<NodeHandle>) -> Self {
        Content::Nodes(nodes)
    }
}

/// Insertion, removal and replacement
///
/// Every insertion returns the newly inserted top-level nodes in fragment
/// order. On a [`NodeSet`] each call is broadcast to every member.
pub trait NodeManipulation {
    fn insert<C: Into<Content>>(&self, position: Position, content: C) -> Result<NodeSet>;

    /// Detach from the document
    fn remove(&self) -> Result<()>;

    /// Remove all children
    fn empty(&self) -> Result<()>;

    /// Insert `content` in place of the receiver, then remove the receiver
    fn replace_with<C: Into<Content>>(&self, content: C) -> Result<NodeSet>;

    fn append_with<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        self.insert(Position::Append, content)
    }

    fn prepend_with<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        self.insert(Position::Prepend, content)
    }

    fn add_previous_sibling_with<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        self.insert(Position::Before, content)
    }

    fn add_next_sibling_with<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        self.insert(Position::After, content)
    }

    fn append<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        self.append_with(content)
    }

    fn prepend<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        self.prepend_with(content)
    }

    fn before<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        self.add_previous_sibling_with(content)
    }

    fn after<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        self.add_next_sibling_with(content)
    }
}

impl NodeManipulation for NodeHandle {
    fn insert<C: Into<Content>>(&self, position: Position, content: C) -> Result<NodeSet> {
        let result = insert_content(self, Graft::At(position), &content.into(), false);
        self.track(result)
    }

    fn remove(&self) -> Result<()> {
        let result = remove_slot(self);
        self.track(result)
    }

    fn empty(&self) -> Result<()> {
        let result = empty_node(self);
        self.track(result)
    }

    fn replace_with<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        let result = insert_content(self, Graft::Replace, &content.into(), false);
        self.track(result)
    }
}

impl NodeHandle {
    /// Strip namespaces from this node and every descendant element:
    /// declarations are removed and element and attribute names lose their
    /// namespace. When stripping makes two attribute names collide, the one
    /// that had no namespace wins.
    pub fn remove_namespaces(&self) -> Result<()> {
        let result = strip_namespaces(self);
        self.track(result)
    }
}

/// Insertion mode: a position, or replacement of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Graft {
    At(Position),
    Replace,
}

/// Content after serialization of foreign nodes
enum Piece {
    Markup(String),
    Move(Node),
}

/// A fresh or moved node queued for insertion
struct Pending {
    node: Node,
    is_text: bool,
}

/// Insert `content` relative to `target`; `copy` forces node content to be
/// copied instead of moved
pub(crate) fn insert_content(target: &NodeHandle, graft: Graft, content: &Content, copy: bool) -> Result<NodeSet> {
    let store = target.attached()?;
    let pieces = collect_pieces(&store, content, copy)?;

    let inserted = {
        let mut tree = store.borrow_mut();
        let inserted = graft_pieces(&mut tree, target.slot(), graft, pieces)?;
        tree.bump("insert");
        inserted
    };
    tracing::debug!("{:?}: inserted {} nodes", graft, inserted.len());
    Ok(inserted
        .into_iter()
        .map(|node| NodeHandle::new(&store, Slot::Node(node)))
        .collect())
}

/// Turn content into pieces. Nodes from another document (or all nodes when
/// copying) are serialized here, before the target store is borrowed.
fn collect_pieces(store: &Rc<RefCell<TreeStore>>, content: &Content, copy: bool) -> Result<Vec<Piece>> {
    let mut pieces: Vec<Piece> = Vec::new();

    match content {
        Content::Markup(markup) => push_markup(&mut pieces, markup.clone()),
        Content::Nodes(nodes) => {
            for node in nodes {
                let kind = node.kind()?;
                let Slot::Node(tree_node) = node.slot() else {
                    return Err(Error::invalid(kind, "attribute and namespace nodes cannot be inserted"));
                };
                if kind == NodeKind::Document {
                    return Err(Error::invalid(kind, "a document node cannot be inserted"));
                }
                if copy || !node.belongs_to(store) {
                    push_markup(&mut pieces, node.xml()?);
                } else {
                    pieces.push(Piece::Move(tree_node));
                }
            }
        }
    }
    Ok(pieces)
}

/// Consecutive markup is parsed as one fragment
fn push_markup(pieces: &mut Vec<Piece>, markup: String) {
    match pieces.last_mut() {
        Some(Piece::Markup(previous)) => previous.push_str(&markup),
        _ => pieces.push(Piece::Markup(markup)),
    }
}

fn graft_pieces(tree: &mut TreeStore, target: Slot, graft: Graft, pieces: Vec<Piece>) -> Result<Vec<Node>> {
    let Slot::Node(target) = target else {
        return Err(Error::invalid(
            tree.kind(target),
            "cannot insert relative to an attribute or namespace node",
        ));
    };
    let target_kind = tree.kind(Slot::Node(target));

    // Where the content goes
    let inside = matches!(graft, Graft::At(Position::Append) | Graft::At(Position::Prepend));
    let parent = if inside {
        if !matches!(target_kind, NodeKind::Element | NodeKind::Document) {
            return Err(Error::invalid(target_kind, "only elements and documents have children"));
        }
        target
    } else {
        if target_kind == NodeKind::Document {
            return Err(Error::invalid(target_kind, "the document node has no siblings"));
        }
        tree.xot()
            .parent(target)
            .ok_or_else(|| Error::invalid(target_kind, "node has no parent"))?
    };
    let at_document_level = tree.xot().is_document(parent);

    // Validate moves before anything changes
    for piece in &pieces {
        if let Piece::Move(node) = piece {
            let node = *node;
            if tree.is_ancestor_or_self(node, parent) {
                return Err(Error::invalid(
                    tree.kind(Slot::Node(node)),
                    "cannot move a node into itself or its own descendant",
                ));
            }
            if !inside && node == target {
                return Err(Error::invalid(target_kind, "cannot insert a node next to itself"));
            }
            if at_document_level {
                check_document_level(tree, node)?;
            }
        }
    }

    // Parse all markup; on failure nothing has been inserted
    let mut parsed: Vec<Vec<Node>> = Vec::new();
    for piece in &pieces {
        if let Piece::Markup(markup) = piece {
            match parse_fragment(tree, parent, markup) {
                Ok(nodes) => parsed.push(nodes),
                Err(e) => {
                    parsed.into_iter().flatten().for_each(|node| tree.discard(node));
                    return Err(e);
                }
            }
        }
    }
    if at_document_level {
        let checked = parsed
            .iter()
            .flatten()
            .try_for_each(|&node| check_document_level(tree, node));
        if let Err(e) = checked {
            parsed.into_iter().flatten().for_each(|node| tree.discard(node));
            return Err(e);
        }
    }

    // Assemble in content order
    let mut parsed = parsed.into_iter();
    let mut pending: Vec<Pending> = Vec::new();
    let mut moved: Vec<Node> = Vec::new();
    for piece in pieces {
        let nodes = match piece {
            Piece::Markup(_) => parsed.next().unwrap_or_default(),
            Piece::Move(node) => {
                moved.push(node);
                vec![node]
            }
        };
        for node in nodes {
            let is_text = tree.xot().text_str(node).is_some();
            if at_document_level && is_text {
                // whitespace only, checked above
                tree.discard(node);
                continue;
            }
            pending.push(Pending { node, is_text });
        }
    }

    // A marker comment holds the insertion point while moved nodes leave
    // their old place. Text beside the target never merges across it.
    let marker = tree.xot_mut().new_comment("");
    let placed = {
        let xot = tree.xot_mut();
        match graft {
            Graft::At(Position::Append) => xot.append(target, marker),
            Graft::At(Position::Prepend) => xot.prepend(target, marker),
            Graft::At(Position::Before) | Graft::Replace => xot.insert_before(target, marker),
            Graft::At(Position::After) => xot.insert_after(target, marker),
        }
    };
    if let Err(e) = placed {
        tree.discard(marker);
        for item in &pending {
            if !moved.contains(&item.node) {
                tree.discard(item.node);
            }
        }
        return Err(Error::invalid(target_kind, e.to_string()));
    }

    let mut survivors: HashMap<Node, Node> = HashMap::new();
    let grafted = move_and_graft(tree, target, graft, marker, pending, moved, &mut survivors);
    let removed = tree.detach(marker, None);
    let mut result = grafted?;
    if let Some((retired, survivor)) = removed? {
        survivors.insert(retired, survivor);
    }

    // Report survivors in place of merged text, once each
    for node in result.iter_mut() {
        while let Some(&survivor) = survivors.get(node) {
            *node = survivor;
        }
    }
    let mut seen = HashSet::new();
    result.retain(|node| seen.insert(*node));
    Ok(result)
}

/// Take moved nodes out of their old place and insert everything before
/// `marker`
fn move_and_graft(
    tree: &mut TreeStore,
    target: Node,
    graft: Graft,
    marker: Node,
    pending: Vec<Pending>,
    mut moved: Vec<Node>,
    survivors: &mut HashMap<Node, Node>,
) -> Result<Vec<Node>> {
    if graft == Graft::Replace {
        // the marker precedes the target, so nothing merges here
        tree.detach(target, None)?;
    }

    // Text first: detaching a text node never joins two other text nodes
    let keep = match graft {
        Graft::At(Position::Before) | Graft::At(Position::After) => Some(target),
        _ => None,
    };
    moved.sort_by_key(|&node| tree.xot().text_str(node).is_none());
    for node in moved {
        if tree.xot().parent(node).is_some() {
            if let Some((retired, survivor)) = tree.detach(node, keep)? {
                survivors.insert(retired, survivor);
            }
        }
    }

    let prev = tree.xot().previous_sibling(marker);
    let next = tree.xot().next_sibling(marker);
    graft_nodes(tree, marker, prev, next, pending, survivors)
}

/// Insert parentless nodes before `marker`, merging boundary text into the
/// neighbouring text nodes `prev` and `next`
fn graft_nodes(
    tree: &mut TreeStore,
    marker: Node,
    prev: Option<Node>,
    next: Option<Node>,
    pending: Vec<Pending>,
    survivors: &mut HashMap<Node, Node>,
) -> Result<Vec<Node>> {
    let result: Vec<Node> = pending.iter().map(|p| p.node).collect();

    // Adjacent text within the content folds into the earlier node
    let mut queue: Vec<Pending> = Vec::new();
    for item in pending {
        if let Some(last) = queue.last() {
            if last.is_text && item.is_text {
                let text = tree.xot().text_str(item.node).unwrap_or_default().to_string();
                let into = last.node;
                tree.merge_text(into, &text, false);
                tree.retire(item.node);
                survivors.insert(item.node, into);
                continue;
            }
        }
        queue.push(item);
    }

    let is_text = |tree: &TreeStore, node: Option<Node>| node.map_or(false, |n| tree.xot().text_str(n).is_some());

    if let Some(first) = queue.first() {
        if first.is_text && is_text(tree, prev) {
            if let Some(prev) = prev {
                let text = tree.xot().text_str(first.node).unwrap_or_default().to_string();
                tree.merge_text(prev, &text, false);
                tree.retire(first.node);
                survivors.insert(first.node, prev);
                queue.remove(0);
            }
        }
    }
    if let Some(last) = queue.last() {
        if last.is_text && is_text(tree, next) {
            if let Some(next) = next {
                let text = tree.xot().text_str(last.node).unwrap_or_default().to_string();
                tree.merge_text(next, &text, true);
                tree.retire(last.node);
                survivors.insert(last.node, next);
                queue.pop();
            }
        }
    }

    let xot = tree.xot_mut();
    for item in queue {
        xot.insert_before(marker, item.node)
            .map_err(|e| Error::invalid(NodeKind::Element, e.to_string()))?;
    }
    Ok(result)
}

/// Only comments, processing instructions and whitespace may sit beside the
/// document element
fn check_document_level(tree: &TreeStore, node: Node) -> Result<()> {
    let xot = tree.xot();
    match xot.value(node) {
        Value::Comment(_) | Value::ProcessingInstruction(_) => Ok(()),
        Value::Text(text) if text.get().trim().is_empty() => Ok(()),
        Value::Element(_) => Err(Error::invalid(
            NodeKind::Element,
            "the document already has a document element",
        )),
        _ => Err(Error::invalid(
            tree.kind(Slot::Node(node)),
            "only comments and processing instructions can be inserted at document level",
        )),
    }
}

/// Parse markup as a fragment in the namespace scope of `parent`.
///
/// The markup is wrapped in an element carrying the in-scope declarations
/// (plus the document's registered bindings), parsed into the arena, and the
/// wrapper's children are detached as parentless nodes.
pub(crate) fn parse_fragment(tree: &mut TreeStore, parent: Node, markup: &str) -> Result<Vec<Node>> {
    let mut scope = tree.in_scope_namespaces(parent);
    for (prefix, uri) in tree.bindings.iter() {
        if scope.iter().all(|(p, _)| p != prefix) {
            scope.push((prefix.to_string(), uri.to_string()));
        }
    }

    let mut wrapped = format!("<{}", FRAGMENT_WRAPPER);
    for (prefix, uri) in &scope {
        if prefix.is_empty() {
            write!(wrapped, " xmlns=\"{}\"", escape(uri.as_str()))?;
        } else {
            write!(wrapped, " xmlns:{}=\"{}\"", prefix, escape(uri.as_str()))?;
        }
    }
    write!(wrapped, ">{}</{}>", markup, FRAGMENT_WRAPPER)?;

    let xot = tree.xot_mut();
    let document = xot
        .parse(&wrapped)
        .map_err(|e| Error::ParseFragment(e.to_string()))?;
    let wrapper = xot
        .document_element(document)
        .map_err(|e| Error::ParseFragment(e.to_string()))?;
    let nodes: Vec<Node> = xot.children(wrapper).collect();
    for &node in &nodes {
        xot.detach(node)
            .map_err(|e| Error::ParseFragment(e.to_string()))?;
    }
    if let Err(e) = xot.remove(document) {
        tracing::trace!("could not drop fragment wrapper: {}", e);
    }
    Ok(nodes)
}

fn remove_slot(handle: &NodeHandle) -> Result<()> {
    let store = handle.attached()?;
    let mut tree = store.borrow_mut();
    match handle.slot() {
        Slot::Node(node) => {
            let kind = tree.kind(Slot::Node(node));
            if kind == NodeKind::Document {
                return Err(Error::invalid(kind, "the document node cannot be removed"));
            }
            let parent = tree.xot().parent(node);
            if kind == NodeKind::Element && parent.map_or(false, |p| tree.xot().is_document(p)) {
                return Err(Error::invalid(kind, "the document element cannot be removed"));
            }
            tree.detach(node, None)?;
            tracing::debug!("removed {} node", kind);
        }
        Slot::Attribute(element, name) => {
            tree.xot_mut().attributes_mut(element).remove(name);
            tracing::debug!("removed attribute");
        }
        Slot::Namespace(element, prefix) => {
            tree.xot_mut().namespaces_mut(element).remove(prefix);
            tracing::debug!("removed namespace declaration");
        }
    }
    tree.bump("remove");
    Ok(())
}

fn empty_node(handle: &NodeHandle) -> Result<()> {
    let store = handle.attached()?;
    let mut tree = store.borrow_mut();
    let slot = handle.slot();
    let node = match slot {
        Slot::Node(node) if matches!(tree.kind(slot), NodeKind::Element | NodeKind::Document) => node,
        other => return Err(Error::invalid(tree.kind(other), "only elements and documents have children")),
    };
    let keep = if tree.xot().is_document(node) {
        tree.xot().document_element(node).ok()
    } else {
        None
    };
    let children: Vec<Node> = tree.xot().children(node).filter(|&c| Some(c) != keep).collect();
    let count = children.len();
    for child in children {
        tree.detach_raw(child)?;
    }
    tree.bump("empty");
    tracing::debug!("emptied node, {} children removed", count);
    Ok(())
}

fn strip_namespaces(handle: &NodeHandle) -> Result<()> {
    let store = handle.attached()?;
    let mut tree = store.borrow_mut();
    let start = match handle.slot() {
        Slot::Node(node) => node,
        other => return Err(Error::invalid(tree.kind(other), "namespaces can only be removed from elements")),
    };
    if tree.xot().element(start).is_none() && !tree.xot().is_document(start) {
        return Err(Error::invalid(
            tree.kind(Slot::Node(start)),
            "namespaces can only be removed from elements",
        ));
    }

    let mut elements = Vec::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if tree.xot().element(node).is_some() {
            elements.push(node);
        }
        let children: Vec<Node> = tree.xot().children(node).collect();
        stack.extend(children.into_iter().rev());
    }

    for &element in &elements {
        let prefixes: Vec<_> = tree.xot().namespaces(element).iter().map(|(prefix, _)| prefix).collect();
        for prefix in prefixes {
            tree.xot_mut().namespaces_mut(element).remove(prefix);
        }

        if let Some(name) = tree.xot().element(element).map(|e| e.name()) {
            let (local, uri) = tree.name_parts(name);
            if !uri.is_empty() {
                let plain = tree.name_id(&local, "");
                if let Some(element) = tree.xot_mut().element_mut(element) {
                    element.set_name(plain);
                }
            }
        }

        let namespaced: Vec<_> = tree
            .attribute_ids(element)
            .into_iter()
            .filter(|&id| !tree.name_parts(id).1.is_empty())
            .collect();
        for id in namespaced {
            let value = tree.attribute_value(element, id).unwrap_or_default();
            let local = tree.name_parts(id).0;
            tree.xot_mut().attributes_mut(element).remove(id);
            if tree.find_attribute_ns(element, &local, "").is_none() {
                let plain = tree.name_id(&local, "");
                tree.xot_mut().attributes_mut(element).insert(plain, value);
            }
        }
    }

    tree.bump("remove_namespaces");
    tracing::debug!("removed namespaces from {} elements", elements.len());
    Ok(())
}

/// Run `op` on every member, stopping at the first failure
pub(crate) fn broadcast<T>(
    members: &NodeSet,
    mut op: impl FnMut(usize, &NodeHandle) -> Result<T>,
) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(members.len());
    for (index, member) in members.iter().enumerate() {
        match op(index, member) {
            Ok(value) => results.push(value),
            Err(source) => {
                let key = member.key().ok();
                tracing::warn!("node set member {} failed: {}", index, source);
                return Err(Error::Broadcast {
                    index,
                    key,
                    source: Box::new(source),
                });
            }
        }
    }
    Ok(results)
}

impl NodeManipulation for NodeSet {
    fn insert<C: Into<Content>>(&self, position: Position, content: C) -> Result<NodeSet> {
        broadcast_insert(self, Graft::At(position), &content.into())
    }

    fn remove(&self) -> Result<()> {
        broadcast(self, |_, member| member.remove()).map(|_| ())
    }

    fn empty(&self) -> Result<()> {
        broadcast(self, |_, member| member.empty()).map(|_| ())
    }

    fn replace_with<C: Into<Content>>(&self, content: C) -> Result<NodeSet> {
        broadcast_insert(self, Graft::Replace, &content.into())
    }
}

/// Node content is copied for every member but the last, which receives the
/// nodes themselves
fn broadcast_insert(members: &NodeSet, graft: Graft, content: &Content) -> Result<NodeSet> {
    let last = members.len().saturating_sub(1);
    let inserted = broadcast(members, |index, member| {
        let result = insert_content(member, graft, content, index < last);
        member.track(result)
    })?;
    Ok(inserted.into_iter().flatten().collect())
}
