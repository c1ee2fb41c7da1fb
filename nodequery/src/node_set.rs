//! Ordered collections of node handles
//!
//! Every query, traversal and insertion yields a [`NodeSet`]. Sets keep the
//! order they were built in and may hold duplicates.

use std::ops::Index;
use std::slice;
use std::vec;

use crate::error::Result;
use crate::handle::NodeHandle;
use crate::manipulation::broadcast;
use crate::store::NodeKey;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    nodes: Vec<NodeHandle>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NodeHandle> {
        self.nodes.get(index)
    }

    pub fn first(&self) -> Option<&NodeHandle> {
        self.nodes.first()
    }

    pub fn last(&self) -> Option<&NodeHandle> {
        self.nodes.last()
    }

    pub fn iter(&self) -> slice::Iter<'_, NodeHandle> {
        self.nodes.iter()
    }

    pub fn push(&mut self, node: NodeHandle) {
        self.nodes.push(node);
    }

    pub fn into_vec(self) -> Vec<NodeHandle> {
        self.nodes
    }

    /// Members for which `predicate` holds, in order
    pub fn filter(&self, mut predicate: impl FnMut(&NodeHandle) -> bool) -> NodeSet {
        self.nodes.iter().filter(|node| predicate(node)).cloned().collect()
    }

    pub fn keys(&self) -> Result<Vec<NodeKey>> {
        broadcast(self, |_, member| member.unique_key())
    }

    /// Concatenated text of all members
    pub fn text(&self) -> Result<String> {
        Ok(broadcast(self, |_, member| member.text())?.concat())
    }

    /// Concatenated markup of all members
    pub fn xml(&self) -> Result<String> {
        Ok(broadcast(self, |_, member| member.xml())?.concat())
    }

    pub fn set_attribute(&self, name: &str, value: &str) -> Result<()> {
        broadcast(self, |_, member| member.set_attribute(name, value)).map(|_| ())
    }

    pub fn remove_attribute(&self, name: &str) -> Result<()> {
        broadcast(self, |_, member| member.remove_attribute(name)).map(|_| ())
    }

    pub fn set_tag(&self, name: &str) -> Result<()> {
        broadcast(self, |_, member| member.set_tag(name)).map(|_| ())
    }

    pub fn remove_namespaces(&self) -> Result<()> {
        broadcast(self, |_, member| member.remove_namespaces()).map(|_| ())
    }
}

impl Index<usize> for NodeSet {
    type Output = NodeHandle;

    fn index(&self, index: usize) -> &NodeHandle {
        &self.nodes[index]
    }
}

impl IntoIterator for NodeSet {
    type Item = NodeHandle;
    type IntoIter = vec::IntoIter<NodeHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = &'a NodeHandle;
    type IntoIter = slice::Iter<'a, NodeHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

impl FromIterator<NodeHandle> for NodeSet {
    fn from_iter<I: IntoIterator<Item = NodeHandle>>(iter: I) -> Self {
        NodeSet {
            nodes: iter.into_iter().collect(),
        }
    }
}

impl Extend<NodeHandle> for NodeSet {
    fn extend<I: IntoIterator<Item = NodeHandle>>(&mut self, iter: I) {
        self.nodes.extend(iter);
    }
}

impl From<Vec<NodeHandle>> for NodeSet {
    fn from(nodes: Vec<NodeHandle>) -> Self {
        NodeSet { nodes }
    }
}
