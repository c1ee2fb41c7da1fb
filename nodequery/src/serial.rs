//! XML serializer for handles and documents
//!
//! Walks the xot tree and writes markup directly, so the output can be
//! produced for any subtree (attached or detached) with the namespace
//! declarations it needs to stand on its own.

use std::borrow::Cow;
use std::fmt::Write;

use quick_xml::escape::{escape, partial_escape};
use serde::{Deserialize, Serialize};
use xot::{Node, Value};

use crate::error::{Error, Result};
use crate::handle::XML_NAMESPACE;
use crate::store::{Slot, TreeStore};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Options for XML serialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializeOptions {
    /// Indent nested elements, one per line.
    /// Off by default: formatting whitespace changes the string value.
    pub pretty_print: bool,
    /// Indentation string (default: 2 spaces)
    pub indent: String,
    /// Emit `<?xml ...?>` before a serialized document node
    pub xml_declaration: bool,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        SerializeOptions {
            pretty_print: false,
            indent: "  ".to_string(),
            xml_declaration: false,
        }
    }
}

impl SerializeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pretty_print(mut self, pretty_print: bool) -> Self {
        self.pretty_print = pretty_print;
        self
    }

    pub fn with_indent(mut self, indent: impl Into<String>) -> Self {
        self.indent = indent.into();
        self
    }

    pub fn with_xml_declaration(mut self, xml_declaration: bool) -> Self {
        self.xml_declaration = xml_declaration;
        self
    }
}

/// Serialize the node a slot names; `inner` renders only its children
pub(crate) fn render(store: &TreeStore, slot: Slot, options: &SerializeOptions, inner: bool) -> Result<String> {
    let mut renderer = Renderer {
        store,
        options,
        scopes: Vec::new(),
        generated: 0,
        out: String::new(),
    };
    match slot {
        Slot::Attribute(element, name) => {
            if inner {
                return Ok(String::new());
            }
            let value = store
                .attribute_value(element, name)
                .ok_or_else(|| Error::Serialize("attribute no longer exists".to_string()))?;
            let (local, uri) = store.name_parts(name);
            let qualified = match attribute_prefix_in_tree(store, element, &uri) {
                Some(prefix) => format!("{}:{}", prefix, local),
                None => local,
            };
            write!(renderer.out, "{}=\"{}\"", qualified, escape_attribute(&value))?;
        }
        Slot::Namespace(element, prefix) => {
            if inner {
                return Ok(String::new());
            }
            let uri = store
                .declared_namespace(element, prefix)
                .ok_or_else(|| Error::Serialize("namespace declaration no longer exists".to_string()))?;
            let prefix = store.xot().prefix_str(prefix);
            write_declaration(&mut renderer.out, prefix, &uri)?;
        }
        Slot::Node(node) => {
            let is_document = store.xot().is_document(node);
            if is_document && !inner && options.xml_declaration {
                renderer.out.push_str(XML_DECLARATION);
                if options.pretty_print {
                    renderer.out.push('\n');
                }
            }
            if inner || is_document {
                let children: Vec<Node> = store.xot().children(node).collect();
                for child in children {
                    renderer.node(child, 0)?;
                }
            } else {
                renderer.node(node, 0)?;
            }
        }
    }
    Ok(renderer.out)
}

fn attribute_prefix_in_tree(store: &TreeStore, element: Node, uri: &str) -> Option<String> {
    if uri.is_empty() {
        None
    } else if uri == XML_NAMESPACE {
        Some("xml".to_string())
    } else {
        store.prefix_for_uri(element, uri)
    }
}

/// Text content with `\r` kept as a character reference, since parsers
/// normalize a literal one to `\n`
fn escape_text(text: &str) -> Cow<'_, str> {
    let escaped = partial_escape(text);
    if escaped.contains('\r') {
        Cow::Owned(escaped.replace('\r', "&#13;"))
    } else {
        escaped
    }
}

/// Attribute value with tab, newline and carriage return kept as character
/// references, since attribute value normalization turns them into spaces
fn escape_attribute(value: &str) -> Cow<'_, str> {
    let escaped = escape(value);
    if escaped.contains(|c: char| matches!(c, '\t' | '\n' | '\r')) {
        Cow::Owned(
            escaped
                .replace('\t', "&#9;")
                .replace('\n', "&#10;")
                .replace('\r', "&#13;"),
        )
    } else {
        escaped
    }
}

fn write_declaration(out: &mut String, prefix: &str, uri: &str) -> Result<()> {
    if prefix.is_empty() {
        write!(out, "xmlns=\"{}\"", escape_attribute(uri))?;
    } else {
        write!(out, "xmlns:{}=\"{}\"", prefix, escape_attribute(uri))?;
    }
    Ok(())
}

struct Renderer<'a> {
    store: &'a TreeStore,
    options: &'a SerializeOptions,
    /// Declarations written so far, one frame per open element
    scopes: Vec<Vec<(String, String)>>,
    generated: usize,
    out: String,
}

impl Renderer<'_> {
    fn bound(&self, prefix: &str) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|frame| frame.iter().rev())
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    /// A prefix already usable for `uri` in the output
    fn output_prefix(&self, uri: &str, allow_default: bool) -> Option<String> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|frame| frame.iter().rev())
            .filter(|(p, u)| u == uri && (allow_default || !p.is_empty()))
            .find(|(p, _)| self.bound(p) == Some(uri))
            .map(|(p, _)| p.clone())
    }

    fn declare(&mut self, extra: &mut Vec<(String, String)>, prefix: &str, uri: &str) {
        extra.push((prefix.to_string(), uri.to_string()));
        if let Some(frame) = self.scopes.last_mut() {
            frame.push((prefix.to_string(), uri.to_string()));
        }
    }

    fn indent(&mut self, depth: usize) {
        if self.options.pretty_print {
            let indent = self.options.indent.repeat(depth);
            self.out.push_str(&indent);
        }
    }

    fn newline(&mut self) {
        if self.options.pretty_print {
            self.out.push('\n');
        }
    }

    fn node(&mut self, node: Node, depth: usize) -> Result<()> {
        let store = self.store;
        let xot = store.xot();
        match xot.value(node) {
            Value::Document => {
                let children: Vec<Node> = xot.children(node).collect();
                for child in children {
                    self.node(child, depth)?;
                }
            }
            Value::Element(_) => self.element(node, depth)?,
            Value::Text(text) => {
                let content = text.get();
                if self.options.pretty_print {
                    let trimmed = content.trim();
                    if !trimmed.is_empty() {
                        self.indent(depth);
                        self.out.push_str(&escape_text(trimmed));
                        self.newline();
                    }
                } else {
                    self.out.push_str(&escape_text(content));
                }
            }
            Value::Comment(comment) => {
                self.indent(depth);
                write!(self.out, "<!--{}-->", comment.get())?;
                self.newline();
            }
            Value::ProcessingInstruction(pi) => {
                self.indent(depth);
                self.out.push_str("<?");
                self.out.push_str(xot.local_name_str(pi.target()));
                if let Some(data) = pi.data() {
                    self.out.push(' ');
                    self.out.push_str(data);
                }
                self.out.push_str("?>");
                self.newline();
            }
            Value::Attribute(_) | Value::Namespace(_) => {}
        }
        Ok(())
    }

    fn element(&mut self, node: Node, depth: usize) -> Result<()> {
        let store = self.store;
        let xot = store.xot();
        let element = xot
            .element(node)
            .ok_or_else(|| Error::Serialize("expected an element".to_string()))?;

        let stored = store.declarations(node);
        let tree_scope = store.in_scope_namespaces(node);
        self.scopes.push(stored.clone());
        let mut extra = Vec::new();

        let (local, uri) = store.name_parts(element.name());
        let element_prefix = if uri.is_empty() {
            if self.bound("").map_or(false, |u| !u.is_empty()) {
                self.declare(&mut extra, "", "");
            }
            String::new()
        } else {
            let in_tree = tree_scope
                .iter()
                .find(|(p, u)| p.is_empty() && *u == uri)
                .or_else(|| tree_scope.iter().rev().find(|(_, u)| *u == uri))
                .map(|(p, _)| p.clone());
            match in_tree {
                Some(prefix) => {
                    if self.bound(&prefix) != Some(uri.as_str()) {
                        self.declare(&mut extra, &prefix, &uri);
                    }
                    prefix
                }
                None => match self.output_prefix(&uri, true) {
                    Some(prefix) => prefix,
                    None => {
                        self.declare(&mut extra, "", &uri);
                        String::new()
                    }
                },
            }
        };
        let name = qualify(&element_prefix, &local);

        let mut attributes = Vec::new();
        for (attr_name, value) in xot.attributes(node).iter() {
            let (attr_local, attr_uri) = store.name_parts(attr_name);
            let prefix = if attr_uri.is_empty() {
                String::new()
            } else if attr_uri == XML_NAMESPACE {
                "xml".to_string()
            } else if let Some(prefix) = store.prefix_for_uri(node, &attr_uri) {
                if self.bound(&prefix) != Some(attr_uri.as_str()) {
                    self.declare(&mut extra, &prefix, &attr_uri);
                }
                prefix
            } else if let Some(prefix) = self.output_prefix(&attr_uri, false) {
                prefix
            } else {
                let prefix = self.fresh_prefix();
                self.declare(&mut extra, &prefix, &attr_uri);
                prefix
            };
            attributes.push((qualify(&prefix, &attr_local), value.to_string()));
        }

        self.indent(depth);
        write!(self.out, "<{}", name)?;
        for (prefix, uri) in stored.iter().chain(extra.iter()) {
            self.out.push(' ');
            write_declaration(&mut self.out, prefix, uri)?;
        }
        for (attr_name, value) in &attributes {
            write!(self.out, " {}=\"{}\"", attr_name, escape_attribute(value))?;
        }

        let children: Vec<Node> = xot.children(node).collect();
        if children.is_empty() {
            self.out.push_str("/>");
            self.newline();
        } else if children.len() == 1 && xot.text_str(children[0]).is_some() {
            // Single text child stays inline
            let text = xot.text_str(children[0]).unwrap_or_default();
            let content = if self.options.pretty_print {
                text.trim_end_matches('\n').trim_end_matches('\r')
            } else {
                text
            };
            write!(self.out, ">{}</{}>", escape_text(content), name)?;
            self.newline();
        } else {
            self.out.push('>');
            self.newline();
            for child in children {
                self.node(child, depth + 1)?;
            }
            self.indent(depth);
            write!(self.out, "</{}>", name)?;
            self.newline();
        }

        self.scopes.pop();
        Ok(())
    }

    fn fresh_prefix(&mut self) -> String {
        loop {
            let candidate = format!("ns{}", self.generated);
            self.generated += 1;
            if self.bound(&candidate).is_none() {
                return candidate;
            }
        }
    }
}

fn qualify(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_string()
    } else {
        format!("{}:{}", prefix, local)
    }
}
