use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::errors::{NamespaceError, NamespaceResult};

const CORE_LEXICON: &str = include_str!("../../lexicon/blockchain.json");

const TYPE_KEY: &str = "@type";
const SYNONYM_KEY: &str = "@synonym";

/// A declared node of the raw taxonomy, before any inheritance is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphNode {
    name: String,
    children: BTreeMap<String, Arc<GraphNode>>,
    types: BTreeSet<String>,
    synonym: Option<String>,
}

impl GraphNode {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Children declared directly on this node (no inherited children).
    pub fn children(&self) -> &BTreeMap<String, Arc<GraphNode>> {
        &self.children
    }

    /// Ids of the tags this node declares itself to be.
    pub fn types(&self) -> &BTreeSet<String> {
        &self.types
    }

    /// Dot-path, relative to the parent, of the tag this node is a synonym of.
    pub fn synonym(&self) -> Option<&str> {
        self.synonym.as_deref()
    }

    fn parse(name: &str, value: &Value) -> NamespaceResult<Self> {
        let object = value.as_object().ok_or_else(|| {
            NamespaceError::InvalidLexicon(format!("'{}' must be declared as an object", name))
        })?;

        let mut node = GraphNode::named(name);
        for (key, value) in object {
            match key.as_str() {
                TYPE_KEY => node.types.extend(parse_types(name, value)?),
                SYNONYM_KEY => {
                    let synonym = value.as_str().ok_or_else(|| {
                        NamespaceError::InvalidLexicon(format!(
                            "'{}' declares a non-string synonym",
                            name
                        ))
                    })?;
                    node.synonym = Some(synonym.to_string());
                }
                other if other.starts_with('@') => {
                    return Err(NamespaceError::InvalidLexicon(format!(
                        "Unknown directive '{}' on '{}'",
                        other, name
                    )));
                }
                child => {
                    validate_name(child)?;
                    node.children
                        .insert(child.to_string(), Arc::new(GraphNode::parse(child, value)?));
                }
            }
        }
        Ok(node)
    }

    fn merge(&mut self, other: &GraphNode) {
        self.types.extend(other.types.iter().cloned());
        if other.synonym.is_some() {
            self.synonym = other.synonym.clone();
        }
        for (name, theirs) in &other.children {
            match self.children.get_mut(name) {
                Some(ours) => Arc::make_mut(ours).merge(theirs),
                None => {
                    self.children.insert(name.clone(), theirs.clone());
                }
            }
        }
    }

    fn entry(&mut self, path: &str) -> NamespaceResult<&mut GraphNode> {
        let mut node = self;
        for name in path.split('.') {
            validate_name(name)?;
            let child = node
                .children
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(GraphNode::named(name)));
            node = Arc::make_mut(child);
        }
        Ok(node)
    }
}

fn parse_types(name: &str, value: &Value) -> NamespaceResult<Vec<String>> {
    match value {
        Value::String(id) => Ok(vec![id.clone()]),
        Value::Array(ids) => ids
            .iter()
            .map(|id| {
                id.as_str().map(str::to_string).ok_or_else(|| {
                    NamespaceError::InvalidLexicon(format!("'{}' declares a non-string type", name))
                })
            })
            .collect(),
        _ => Err(NamespaceError::InvalidLexicon(format!(
            "'{}' must declare its types as a string or an array of strings",
            name
        ))),
    }
}

fn validate_name(name: &str) -> NamespaceResult<()> {
    if name.is_empty() || name.contains(['.', '[', ']']) {
        return Err(NamespaceError::InvalidLexicon(format!(
            "'{}' is not a valid tag name",
            name
        )));
    }
    Ok(())
}

/// The raw taxonomy a [`Language`](super::Language) is built from.
///
/// Lexicons are nested JSON objects: every key is a child name, except the
/// `@type` directive (a tag id or list of tag ids the node "is a") and the
/// `@synonym` directive (a dot-path, relative to the parent, of the canonical tag).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    root: GraphNode,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in `blockchain.*` taxonomy the session engine depends on.
    pub fn core() -> NamespaceResult<Self> {
        Self::from_json(CORE_LEXICON)
    }

    pub fn from_json(json: &str) -> NamespaceResult<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> NamespaceResult<Self> {
        Ok(Self {
            root: GraphNode::parse("", value)?,
        })
    }

    pub fn roots(&self) -> &BTreeMap<String, Arc<GraphNode>> {
        &self.root.children
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        let mut node = &self.root;
        for name in id.split('.') {
            node = node.children.get(name)?;
        }
        Some(node)
    }

    pub fn merge(&mut self, other: &Graph) {
        self.root.merge(&other.root);
    }

    pub fn merged(mut self, other: &Graph) -> Self {
        self.merge(other);
        self
    }

    /// Declares every node along `path`.
    pub fn declare(mut self, path: &str) -> NamespaceResult<Self> {
        self.root.entry(path)?;
        Ok(self)
    }

    /// Declares `path` and marks it as a `type_id`.
    pub fn declare_type(mut self, path: &str, type_id: &str) -> NamespaceResult<Self> {
        self.root.entry(path)?.types.insert(type_id.to_string());
        Ok(self)
    }

    /// Declares `path` as a synonym of the sibling-relative dot-path `protonym`.
    pub fn declare_synonym(mut self, path: &str, protonym: &str) -> NamespaceResult<Self> {
        self.root.entry(path)?.synonym = Some(protonym.to_string());
        Ok(self)
    }
}
