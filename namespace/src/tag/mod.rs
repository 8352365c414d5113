mod context;
mod graph;
mod key;
mod language;
mod reference;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{NamespaceError, NamespaceResult};
use crate::ids;

pub use context::Context;
pub use graph::{Graph, GraphNode};
pub use key::Key;
pub use language::Language;
pub use reference::{Reference, ToReference};

use language::{intern, lookup, rewire, LanguageInner};

/// Derived structure, computed on first access and kept for the life of the tag.
///
/// Anything that may point back up the tree (parent, ancestors, self) is kept as
/// an id and resolved through the language, so interned tags never form cycles.
#[derive(Default)]
struct Lazy {
    is_graph_node: OnceCell<bool>,
    protonym: OnceCell<Option<Tag>>,
    own_children: OnceCell<BTreeMap<String, Tag>>,
    children: OnceCell<BTreeMap<String, Tag>>,
    own_type: OnceCell<BTreeSet<String>>,
    type_ids: OnceCell<BTreeSet<String>>,
    privacy_policy: OnceCell<String>,
    is_collection: OnceCell<bool>,
    is_leaf: OnceCell<bool>,
    is_leaf_descendant: OnceCell<bool>,
    indices: OnceCell<Vec<String>>,
}

struct TagInner {
    id: String,
    parent_id: Option<String>,
    node: Arc<GraphNode>,
    language: Weak<LanguageInner>,
    language_id: Uuid,
    lazy: Lazy,
}

/// A node of the taxonomy, interned once per id within its [`Language`].
///
/// Tags are cheap to clone. Structural queries (`children`, `type_ids`,
/// `protonym`, leaf-ness...) are resolved lazily and memoized. A tag only
/// answers them while its language is alive; once the language is dropped
/// they resolve to empty results.
#[derive(Clone)]
pub struct Tag(Arc<TagInner>);

/// Tie-break used by [`Tag::last_declared_descendant`] when a payload matches
/// more than one declared child at the same level.
pub enum DescendantPolicy {
    /// Take the first match in name order.
    Any,
    /// Fail with [`NamespaceError::AmbiguousDescendant`].
    Throws,
    /// Let the caller pick among the candidates.
    Priority(Box<dyn Fn(&Tag, &BTreeSet<Tag>) -> NamespaceResult<Tag> + Send + Sync>),
}

impl fmt::Debug for DescendantPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DescendantPolicy::Any => f.write_str("Any"),
            DescendantPolicy::Throws => f.write_str("Throws"),
            DescendantPolicy::Priority(_) => f.write_str("Priority"),
        }
    }
}

impl Tag {
    pub(crate) fn from_node(
        id: String,
        parent_id: Option<String>,
        node: Arc<GraphNode>,
        language: &Arc<LanguageInner>,
    ) -> Self {
        Self(Arc::new(TagInner {
            id,
            parent_id,
            node,
            language: Arc::downgrade(language),
            language_id: language.id,
            lazy: Lazy::default(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn name(&self) -> &str {
        self.0.node.name()
    }

    /// The raw graph node this tag was materialized from.
    pub fn node(&self) -> &GraphNode {
        &self.0.node
    }

    pub fn language(&self) -> Option<Language> {
        self.0.language.upgrade().map(Language::from_inner)
    }

    fn resolve(&self, id: &str) -> Option<Tag> {
        let language = self.0.language.upgrade()?;
        lookup(&language, id)
    }

    fn resolve_all<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> Vec<Tag> {
        ids.into_iter().filter_map(|id| self.resolve(id)).collect()
    }

    pub fn parent(&self) -> Option<Tag> {
        self.0.parent_id.as_deref().and_then(|id| self.resolve(id))
    }

    /// The tag itself followed by each of its ancestors up to the root.
    pub fn lineage(&self) -> impl Iterator<Item = Tag> {
        std::iter::successors(Some(self.clone()), Tag::parent)
    }

    pub(crate) fn is_graph_node(&self) -> bool {
        *self.0.lazy.is_graph_node.get_or_init(|| match self.parent() {
            Some(parent) => {
                parent.is_graph_node() && parent.node().children().contains_key(self.name())
            }
            None => true,
        })
    }

    /// The canonical tag this tag is declared a synonym of.
    pub fn protonym(&self) -> Option<&Tag> {
        self.0
            .lazy
            .protonym
            .get_or_init(|| self.compute_protonym())
            .as_ref()
    }

    fn compute_protonym(&self) -> Option<Tag> {
        let suffix = self.0.node.synonym()?;
        let Some(parent) = self.parent() else {
            log::warn!("Synonym '{}' of '{}' has no parent to resolve against", suffix, self);
            return None;
        };
        let Some(protonym) = parent.descendant_path(suffix) else {
            log::warn!("Could not find protonym '{}' of '{}'", suffix, self);
            return None;
        };
        if let Some(language) = self.0.language.upgrade() {
            rewire(&language, &self.0.id, protonym.clone());
        }
        Some(protonym)
    }

    /// Children declared directly on this tag's node.
    pub fn own_children(&self) -> &BTreeMap<String, Tag> {
        self.0.lazy.own_children.get_or_init(|| {
            let Some(language) = self.0.language.upgrade() else {
                return BTreeMap::new();
            };
            self.0
                .node
                .children()
                .iter()
                .map(|(name, node)| {
                    (name.clone(), intern(&language, Some(&self.0.id), node.clone()))
                })
                .collect()
        })
    }

    /// Own children plus every child inherited from this tag's types.
    pub fn children(&self) -> &BTreeMap<String, Tag> {
        self.0
            .lazy
            .children
            .get_or_init(|| self.compute_children())
    }

    fn compute_children(&self) -> BTreeMap<String, Tag> {
        let Some(language) = self.0.language.upgrade() else {
            return BTreeMap::new();
        };
        if let Some(protonym) = self.protonym() {
            return protonym
                .children()
                .iter()
                .map(|(name, child)| {
                    (name.clone(), intern(&language, Some(&self.0.id), child.0.node.clone()))
                })
                .collect();
        }
        let mut children = self.own_children().clone();
        for own_type in self.own_types() {
            for (name, child) in own_type.children() {
                children.entry(name.clone()).or_insert_with(|| {
                    intern(&language, Some(&self.0.id), child.0.node.clone())
                });
            }
        }
        children
    }

    pub fn own_type_ids(&self) -> &BTreeSet<String> {
        self.0
            .lazy
            .own_type
            .get_or_init(|| self.compute_own_type())
    }

    pub fn own_types(&self) -> Vec<Tag> {
        self.resolve_all(self.own_type_ids())
    }

    fn compute_own_type(&self) -> BTreeSet<String> {
        if self.is_graph_node() {
            return self
                .0
                .node
                .types()
                .iter()
                .filter(|id| self.resolve(id).is_some())
                .cloned()
                .collect();
        }
        let Some(anchor) = self.lineage().find(Tag::is_graph_node) else {
            return BTreeSet::new();
        };
        let remainder = dot_path_after(&self.0.id, &anchor.0.id);
        anchor
            .0
            .node
            .types()
            .iter()
            .filter_map(|id| self.resolve(id)?.descendant_path(remainder))
            .map(|tag| tag.0.id.clone())
            .collect()
    }

    /// Ids of every tag this tag "is": itself, its declared types and their closure.
    pub fn type_ids(&self) -> &BTreeSet<String> {
        self.0.lazy.type_ids.get_or_init(|| {
            if let Some(protonym) = self.protonym() {
                return protonym.type_ids().clone();
            }
            let mut ids = self.own_type_ids().clone();
            ids.insert(self.0.id.clone());
            for own_type in self.own_types() {
                ids.extend(own_type.type_ids().iter().cloned());
            }
            ids
        })
    }

    pub fn types(&self) -> Vec<Tag> {
        self.resolve_all(self.type_ids())
    }

    pub fn is(&self, other: &Tag) -> bool {
        self.0.language_id == other.0.language_id && self.is_id(other.id())
    }

    pub fn is_id(&self, id: &str) -> bool {
        self.type_ids().contains(id)
    }

    /// True when this tag is every one of `types`. Vacuously true for none.
    pub fn is_all<'a>(&self, types: impl IntoIterator<Item = &'a Tag>) -> bool {
        types.into_iter().all(|other| self.is(other))
    }

    pub fn is_not(&self, other: &Tag) -> bool {
        !self.is(other)
    }

    /// Checks this tag against `other`, failing with a diagnostic when it is not one.
    pub fn as_a(&self, other: &Tag) -> NamespaceResult<Tag> {
        if self.is_not(other) {
            return Err(NamespaceError::TypeMismatch {
                tag: self.0.id.clone(),
                expected: other.0.id.clone(),
            });
        }
        Ok(self.clone())
    }

    pub fn is_ancestor_of(&self, other: &Tag) -> bool {
        is_dot_path_descendant(&other.0.id, &self.0.id)
    }

    pub fn is_descendant_of(&self, other: &Tag) -> bool {
        is_dot_path_descendant(&self.0.id, &other.0.id)
    }

    /// The dot-path leading from `ancestor` down to this tag.
    pub fn id_remainder_after(&self, ancestor: &Tag) -> NamespaceResult<String> {
        if !self.is_descendant_of(ancestor) {
            return Err(NamespaceError::NotDescendant {
                tag: self.0.id.clone(),
                ancestor: ancestor.0.id.clone(),
            });
        }
        Ok(dot_path_after(&self.0.id, &ancestor.0.id).to_string())
    }

    /// The named child, substituted by its protonym when it is a synonym.
    pub fn child(&self, name: &str) -> NamespaceResult<Tag> {
        let children = self.children();
        let child = children
            .get(name)
            .ok_or_else(|| NamespaceError::MissingChild {
                tag: self.0.id.clone(),
                name: name.to_string(),
                children: children.keys().cloned().collect(),
            })?;
        Ok(child.protonym().unwrap_or(child).clone())
    }

    pub fn descendant<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> NamespaceResult<Tag> {
        names
            .into_iter()
            .try_fold(self.clone(), |tag, name| tag.child(name))
    }

    /// The descendant at a relative dot-path; the empty path is the tag itself.
    pub fn descendant_path(&self, path: &str) -> Option<Tag> {
        self.descendant(path.split('.').filter(|name| !name.is_empty()))
            .ok()
    }

    pub fn is_collection(&self) -> bool {
        *self
            .0
            .lazy
            .is_collection
            .get_or_init(|| self.is_id(ids::DB_COLLECTION))
    }

    /// The `id` child a collection is indexed by.
    pub fn collection_id(&self) -> Option<Tag> {
        if !self.is_collection() {
            return None;
        }
        self.child("id").ok()
    }

    pub fn is_leaf(&self) -> bool {
        *self.0.lazy.is_leaf.get_or_init(|| {
            self.parent().is_some()
                && !self.is_id(ids::SESSION_STATE_VALUE)
                && !self.is_leaf_descendant()
                && (self.children().is_empty() || self.is_id(ids::DB_LEAF))
        })
    }

    pub fn is_leaf_descendant(&self) -> bool {
        *self.0.lazy.is_leaf_descendant.get_or_init(|| match self.parent() {
            Some(parent) => parent.is_leaf_descendant() || parent.is_leaf(),
            None => false,
        })
    }

    /// Ids of the collection index tags along the lineage, root first.
    pub fn indices(&self) -> &[String] {
        self.0.lazy.indices.get_or_init(|| {
            let mut indices: Vec<String> = self
                .lineage()
                .filter_map(|tag| tag.collection_id())
                .map(|id| id.0.id.clone())
                .collect();
            indices.reverse();
            indices
        })
    }

    /// The first tag in the lineage that is an analytics privacy policy.
    pub fn privacy_policy(&self) -> Option<Tag> {
        let id = self.0.lazy.privacy_policy.get_or_init(|| {
            self.lineage()
                .find(|tag| tag.is_id(ids::PRIVACY_POLICY))
                .map(|tag| tag.0.id.clone())
                .unwrap_or_else(|| ids::PRIVACY_POLICY_INCLUDE.to_string())
        });
        self.resolve(id)
    }

    pub fn analytics(&self) -> Analytics {
        Analytics {
            policy: self.privacy_policy(),
        }
    }

    /// Reads the value found in `data` at the path leading from this tag to `descendant`.
    pub fn value_in(&self, data: &Value, descendant: &Tag) -> NamespaceResult<Value> {
        let path = descendant.id_remainder_after(self)?;
        let found = path
            .split('.')
            .try_fold(data, |value, name| value.get(name))
            .cloned();
        found.ok_or_else(|| NamespaceError::MissingValue {
                tag: self.0.id.clone(),
                path,
            })
    }

    /// Walks `data` downward from this tag, at each level following the declared
    /// child whose name is a key of the payload, and returns the deepest one reached.
    pub fn last_declared_descendant(
        &self,
        data: &Map<String, Value>,
        policy: &DescendantPolicy,
    ) -> NamespaceResult<Tag> {
        let mut tag = self.clone();
        let mut data = data;
        loop {
            let options: Vec<(String, Tag)> = tag
                .node()
                .children()
                .keys()
                .filter(|name| data.contains_key(*name))
                .filter_map(|name| Some((name.clone(), tag.child(name).ok()?)))
                .collect();

            let name = match policy {
                DescendantPolicy::Throws if options.len() > 1 => {
                    return Err(NamespaceError::AmbiguousDescendant {
                        tag: tag.0.id.clone(),
                        options: options.into_iter().map(|(name, _)| name).collect(),
                    });
                }
                DescendantPolicy::Priority(choose) if options.len() > 1 => {
                    let candidates: BTreeSet<Tag> =
                        options.iter().map(|(_, child)| child.clone()).collect();
                    let chosen = choose(&tag, &candidates)?;
                    let name = options
                        .iter()
                        .find(|(_, child)| *child == chosen)
                        .map(|(name, _)| name.clone());
                    tag = chosen;
                    name
                }
                _ => {
                    let (name, child) = options.into_iter().next().ok_or_else(|| {
                        NamespaceError::UndeclaredDescendant {
                            tag: tag.0.id.clone(),
                            keys: data.keys().cloned().collect(),
                        }
                    })?;
                    tag = child;
                    Some(name)
                }
            };

            if tag.node().children().is_empty() {
                break;
            }
            let Some(next) = name
                .and_then(|name| data.get(&name))
                .and_then(Value::as_object)
            else {
                break;
            };
            data = next;
        }
        Ok(tag)
    }

    pub fn reference(&self) -> Reference {
        Reference::new(self.clone(), Context::new())
    }

    pub fn key(&self) -> Key {
        Key::new(self.clone())
    }
}

/// How analytics treat values addressed under a tag.
#[derive(Debug, Clone)]
pub struct Analytics {
    policy: Option<Tag>,
}

impl Analytics {
    pub fn policy(&self) -> Option<&Tag> {
        self.policy.as_ref()
    }

    pub fn is_included(&self) -> bool {
        self.policy
            .as_ref()
            .map_or(true, |policy| policy.is_id(ids::PRIVACY_POLICY_INCLUDE))
    }

    pub fn is_excluded(&self) -> bool {
        self.policy
            .as_ref()
            .is_some_and(|policy| policy.is_id(ids::PRIVACY_POLICY_EXCLUDE))
    }

    pub fn is_obfuscated(&self) -> bool {
        self.policy
            .as_ref()
            .is_some_and(|policy| policy.is_id(ids::PRIVACY_POLICY_OBFUSCATE))
    }
}

fn is_dot_path_descendant(id: &str, ancestor: &str) -> bool {
    id.len() > ancestor.len()
        && id.starts_with(ancestor)
        && id.as_bytes()[ancestor.len()] == b'.'
}

fn dot_path_after<'a>(id: &'a str, ancestor: &str) -> &'a str {
    id.strip_prefix(ancestor)
        .map(|rest| rest.trim_start_matches('.'))
        .unwrap_or(id)
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id && self.0.language_id == other.0.language_id
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .id
            .cmp(&other.0.id)
            .then_with(|| self.0.language_id.cmp(&other.0.language_id))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0.id)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn language(lexicon: Value) -> Language {
        Language::new(Graph::from_value(&lexicon).unwrap()).unwrap()
    }

    #[test]
    fn inherited_children_and_types() {
        let language = language(json!({
            "a": { "b": { "c": { "@type": "t" } } },
            "t": { "d": {} }
        }));
        let c = language.resolve("a.b.c").unwrap();
        let t = language.resolve("t").unwrap();

        assert!(c.children().contains_key("d"));
        assert!(c.is(&t));
        assert!(c.is(&c));

        let d = language.resolve("a.b.c.d").unwrap();
        assert_eq!(d.parent().unwrap(), c);
        assert!(d.is(&language.resolve("t.d").unwrap()));
        assert!(!d.is_graph_node());
    }

    #[test]
    fn is_family_requires_every_type() {
        let language = language(json!({
            "x": { "@type": ["p", "q"] },
            "p": {}, "q": {}, "r": {}
        }));
        let x = language.resolve("x").unwrap();
        let p = language.resolve("p").unwrap();
        let q = language.resolve("q").unwrap();
        let r = language.resolve("r").unwrap();

        assert!(x.is_all([&p, &q]));
        assert!(!x.is_all([&p, &r]));
        assert!(x.is_all([]));
        assert!(x.as_a(&r).is_err());
    }

    #[test]
    fn missing_child_lists_children() {
        let language = Language::core().unwrap();
        let user = language.resolve("blockchain.user").unwrap();
        match user.child("email") {
            Err(NamespaceError::MissingChild { children, .. }) => {
                assert_eq!(children, vec!["id".to_string()]);
            }
            other => panic!("expected a missing child error, got {:?}", other),
        }
    }

    #[test]
    fn synonyms_resolve_to_their_protonym() {
        let language = language(json!({
            "a": {
                "real": { "@type": "t", "leaf": {} },
                "alias": { "@synonym": "real" }
            },
            "t": {}
        }));
        let a = language.resolve("a").unwrap();
        let real = language.resolve("a.real").unwrap();

        assert_eq!(a.child("alias").unwrap(), real);

        let alias = a.children().get("alias").unwrap().clone();
        assert_eq!(alias.protonym(), Some(&real));
        assert!(alias.children().contains_key("leaf"));
        assert!(alias.is(&language.resolve("t").unwrap()));
        assert_eq!(language.resolve("a.alias").unwrap(), real);
    }

    #[test]
    fn remainder_requires_ancestry() {
        let language = Language::core().unwrap();
        let user = language.resolve("blockchain.user").unwrap();
        let id = language.resolve(ids::USER_ID).unwrap();
        let session = language.resolve("blockchain.session").unwrap();

        assert!(user.is_ancestor_of(&id));
        assert!(id.is_descendant_of(&user));
        assert!(!user.is_descendant_of(&user));
        assert_eq!(id.id_remainder_after(&user).unwrap(), "id");
        assert!(matches!(
            id.id_remainder_after(&session),
            Err(NamespaceError::NotDescendant { .. })
        ));
    }

    #[test]
    fn collections_expose_their_indices() {
        let language = Language::core().unwrap();
        let group = language.resolve(ids::NABU_EXPERIMENT_GROUP).unwrap();
        let experiment = language.resolve(ids::NABU_EXPERIMENT).unwrap();

        assert!(experiment.is_collection());
        assert_eq!(experiment.collection_id().unwrap().id(), ids::NABU_EXPERIMENT_ID);
        assert_eq!(group.indices(), &[ids::NABU_EXPERIMENT_ID.to_string()]);
    }

    #[test]
    fn leaves() {
        let language = Language::core().unwrap();
        assert!(language.resolve("blockchain.db.type.string").unwrap().is_leaf());
        assert!(!language.resolve("blockchain").unwrap().is_leaf());
        assert!(!language.resolve(ids::SESSION_STATE_VALUE).unwrap().is_leaf());
        assert!(!language.resolve("blockchain.user").unwrap().is_leaf());
    }

    #[test]
    fn privacy_policy_defaults_to_include() {
        let language = language(json!({
            "secret": { "@type": "blockchain.ux.type.analytics.privacy.policy.exclude", "pin": {} }
        }));
        let pin = language.resolve("secret.pin").unwrap();
        assert!(pin.analytics().is_excluded());

        let user = language.resolve(ids::USER_ID).unwrap();
        assert_eq!(user.privacy_policy().unwrap().id(), ids::PRIVACY_POLICY_INCLUDE);
        assert!(user.analytics().is_included());
    }

    #[test]
    fn value_in_follows_the_remainder() {
        let language = Language::core().unwrap();
        let user = language.resolve("blockchain.user").unwrap();
        let id = language.resolve(ids::USER_ID).unwrap();

        let data = json!({ "id": "alice" });
        assert_eq!(user.value_in(&data, &id).unwrap(), json!("alice"));
        assert!(matches!(
            user.value_in(&json!({}), &id),
            Err(NamespaceError::MissingValue { .. })
        ));
    }

    #[test]
    fn last_declared_descendant_policies() {
        let language = language(json!({
            "app": { "feature": { "x": { "on": {} }, "y": {} } }
        }));
        let app = language.resolve("app").unwrap();
        let payload = json!({ "feature": { "x": { "on": true }, "y": 1 } });
        let data = payload.as_object().unwrap();

        let any = app.last_declared_descendant(data, &DescendantPolicy::Any).unwrap();
        assert_eq!(any.id(), "app.feature.x.on");

        assert!(matches!(
            app.last_declared_descendant(data, &DescendantPolicy::Throws),
            Err(NamespaceError::AmbiguousDescendant { .. })
        ));

        let prefer_y = DescendantPolicy::Priority(Box::new(|_, options| {
            options
                .iter()
                .find(|tag| tag.name() == "y")
                .cloned()
                .ok_or_else(|| NamespaceError::NotFound("y".to_string()))
        }));
        let y = app.last_declared_descendant(data, &prefer_y).unwrap();
        assert_eq!(y.id(), "app.feature.y");

        let nothing = json!({ "unknown": 1 });
        assert!(matches!(
            app.last_declared_descendant(nothing.as_object().unwrap(), &DescendantPolicy::Any),
            Err(NamespaceError::UndeclaredDescendant { .. })
        ));
    }
}
