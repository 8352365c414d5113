use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::graph::{Graph, GraphNode};
use super::Tag;
use crate::errors::{NamespaceError, NamespaceResult};
use crate::ids;

pub(crate) struct LanguageInner {
    pub(crate) id: Uuid,
    pub(crate) graph: Graph,
    pub(crate) nodes: RwLock<HashMap<String, Tag>>,
}

/// Registry owning a taxonomy and the interned [`Tag`] for every id resolved in it.
///
/// Cloning is cheap and shares the same intern table. Two languages built from
/// the same graph are still distinct: tags from one never equal tags from the other.
#[derive(Clone)]
pub struct Language {
    inner: Arc<LanguageInner>,
}

impl Language {
    /// Builds a language from `graph` layered over the core lexicon.
    pub fn new(graph: Graph) -> NamespaceResult<Self> {
        let graph = Graph::core()?.merged(&graph);
        Ok(Self {
            inner: Arc::new(LanguageInner {
                id: Uuid::new_v4(),
                graph,
                nodes: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn core() -> NamespaceResult<Self> {
        Self::new(Graph::new())
    }

    pub fn from_json(json: &str) -> NamespaceResult<Self> {
        Self::new(Graph::from_json(json)?)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn graph(&self) -> &Graph {
        &self.inner.graph
    }

    /// Looks up (and interns) the tag for `id`, if the taxonomy declares or inherits it.
    pub fn tag(&self, id: &str) -> Option<Tag> {
        lookup(&self.inner, id)
    }

    /// Resolves `id`, mapping the empty id to the `none` tag.
    pub fn resolve(&self, id: &str) -> NamespaceResult<Tag> {
        let id = if id.is_empty() { ids::NONE } else { id };
        self.tag(id)
            .ok_or_else(|| NamespaceError::NotFound(id.to_string()))
    }

    pub(crate) fn from_inner(inner: Arc<LanguageInner>) -> Self {
        Self { inner }
    }
}

pub(crate) fn lookup(inner: &Arc<LanguageInner>, id: &str) -> Option<Tag> {
    if let Some(tag) = inner.nodes.read().get(id) {
        return Some(tag.clone());
    }
    match id.rsplit_once('.') {
        None => {
            let node = inner.graph.roots().get(id)?.clone();
            Some(intern(inner, None, node))
        }
        Some((parent, name)) => {
            let parent = lookup(inner, parent)?;
            parent.children().get(name).cloned()
        }
    }
}

/// Returns the interned tag for `parent.name`, creating it on first use.
pub(crate) fn intern(
    inner: &Arc<LanguageInner>,
    parent: Option<&str>,
    node: Arc<GraphNode>,
) -> Tag {
    let id = match parent {
        Some(parent) => format!("{}.{}", parent, node.name()),
        None => node.name().to_string(),
    };
    if let Some(tag) = inner.nodes.read().get(&id) {
        return tag.clone();
    }
    let mut nodes = inner.nodes.write();
    nodes
        .entry(id.clone())
        .or_insert_with(|| {
            Tag::from_node(id, parent.map(str::to_string), node, inner)
        })
        .clone()
}

/// Permanently maps `id` onto `tag` (synonym path compression).
pub(crate) fn rewire(inner: &Arc<LanguageInner>, id: &str, tag: Tag) {
    inner.nodes.write().insert(id.to_string(), tag);
}

impl PartialEq for Language {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Language {}

impl fmt::Debug for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Language")
            .field("id", &self.inner.id)
            .field("interned", &self.inner.nodes.read().len())
            .finish()
    }
}
