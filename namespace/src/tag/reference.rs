use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

use super::{Context, Key, Language, Tag};
use crate::errors::{NamespaceError, NamespaceResult};

/// A tag bound to a context: the address every read, write and subscription uses.
///
/// Identity is the tag plus the indices its lineage's collections resolved to.
/// Context entries that index nothing travel along (e.g. into posted events)
/// but do not distinguish two references.
#[derive(Clone)]
pub struct Reference {
    tag: Tag,
    indices: BTreeMap<String, String>,
    context: Context,
    string: String,
}

impl Reference {
    pub fn new(tag: Tag, context: Context) -> Self {
        let indices: BTreeMap<String, String> = tag
            .indices()
            .iter()
            .filter_map(|id| Some((id.clone(), index_string(context.get(id)?))))
            .collect();
        let string = render(&tag, &indices);
        Self {
            tag,
            indices,
            context,
            string,
        }
    }

    /// Parses `a.b[x].c`, binding each bracketed index to the collection before it.
    pub fn parse(input: &str, language: &Language) -> NamespaceResult<Self> {
        let mut id = String::new();
        let mut context = Context::new();
        for (name, index) in segments(input)? {
            if !id.is_empty() {
                id.push('.');
            }
            id.push_str(&name);
            if let Some(index) = index {
                let collection = language.resolve(&id)?;
                let collection_id = collection.collection_id().ok_or_else(|| {
                    NamespaceError::InvalidReference(format!(
                        "'{}' is indexed but {} is not a collection",
                        input, collection
                    ))
                })?;
                context.insert(collection_id.id(), index);
            }
        }
        Ok(Self::new(language.resolve(&id)?, context))
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn indices(&self) -> &BTreeMap<String, String> {
        &self.indices
    }

    /// The index bound to the collection whose `id` tag is `collection_id`.
    pub fn index(&self, collection_id: &str) -> Option<&str> {
        self.indices.get(collection_id).map(String::as_str)
    }

    /// The dotted id with collection indices interpolated, e.g. `a.b[x].c`.
    pub fn string(&self) -> &str {
        &self.string
    }

    /// Fails unless every collection in the lineage has been given an index.
    pub fn validated(self) -> NamespaceResult<Self> {
        if let Some(missing) = self
            .tag
            .indices()
            .iter()
            .find(|id| !self.indices.contains_key(*id))
        {
            return Err(NamespaceError::InvalidReference(format!(
                "{} is missing an index for {}",
                self.string, missing
            )));
        }
        Ok(self)
    }

    pub fn with_context(&self, context: &Context) -> Self {
        Self::new(self.tag.clone(), self.context.merged(context))
    }

    /// True when this reference is a `pattern` and agrees with every index it pins.
    pub fn matches(&self, pattern: &Reference) -> bool {
        self.tag.is(&pattern.tag)
            && pattern
                .indices
                .iter()
                .all(|(id, index)| self.indices.get(id) == Some(index))
    }
}

fn index_string(value: &Value) -> String {
    match value {
        Value::String(string) => string.clone(),
        other => other.to_string(),
    }
}

fn render(tag: &Tag, indices: &BTreeMap<String, String>) -> String {
    let mut lineage: Vec<Tag> = tag.lineage().collect();
    lineage.reverse();
    lineage
        .iter()
        .map(|tag| {
            match tag
                .collection_id()
                .and_then(|id| indices.get(id.id()))
            {
                Some(index) => format!("{}[{}]", tag.name(), index),
                None => tag.name().to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn segments(input: &str) -> NamespaceResult<Vec<(String, Option<String>)>> {
    let invalid =
        || NamespaceError::InvalidReference(format!("'{}' is not a valid reference", input));
    let mut segments = Vec::new();
    let mut name = String::new();
    let mut index: Option<String> = None;
    let mut depth = 0usize;

    for c in input.chars() {
        match (c, depth) {
            ('[', 0) => {
                if name.is_empty() || index.is_some() {
                    return Err(invalid());
                }
                index = Some(String::new());
                depth = 1;
            }
            (']', 1) => depth = 0,
            ('[', _) => {
                depth += 1;
                index.get_or_insert_with(String::new).push(c);
            }
            (']', _) if depth > 1 => {
                depth -= 1;
                index.get_or_insert_with(String::new).push(c);
            }
            (']', _) => return Err(invalid()),
            ('.', 0) => {
                if name.is_empty() {
                    return Err(invalid());
                }
                segments.push((std::mem::take(&mut name), index.take()));
            }
            (_, 0) if index.is_some() => return Err(invalid()),
            (_, 0) => name.push(c),
            (_, _) => index.get_or_insert_with(String::new).push(c),
        }
    }
    if depth != 0 {
        return Err(invalid());
    }
    if !name.is_empty() {
        segments.push((name, index));
    } else if !input.is_empty() {
        return Err(invalid());
    }
    Ok(segments)
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.indices == other.indices
    }
}

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        self.indices.hash(state);
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.string)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.string)
    }
}

/// Anything that addresses a value: a bare tag, a keyed builder or a reference.
pub trait ToReference {
    fn to_reference(&self) -> Reference;
}

impl ToReference for Reference {
    fn to_reference(&self) -> Reference {
        self.clone()
    }
}

impl ToReference for Tag {
    fn to_reference(&self) -> Reference {
        self.reference()
    }
}

impl ToReference for Key {
    fn to_reference(&self) -> Reference {
        self.reference()
    }
}

impl<T: ToReference + ?Sized> ToReference for &T {
    fn to_reference(&self) -> Reference {
        (**self).to_reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;
    use serde_json::json;

    #[test]
    fn collection_indices_are_interpolated() {
        let language = Language::core().unwrap();
        let group = language.resolve(ids::NABU_EXPERIMENT_GROUP).unwrap();
        let reference = Reference::new(
            group,
            Context::new().with(ids::NABU_EXPERIMENT_ID, "abc"),
        );
        assert_eq!(reference.string(), "blockchain.ux.user.nabu.experiment[abc].group");
        assert_eq!(reference.index(ids::NABU_EXPERIMENT_ID), Some("abc"));
        assert!(reference.validated().is_ok());
    }

    #[test]
    fn unindexed_collections_fail_validation() {
        let language = Language::core().unwrap();
        let group = language.resolve(ids::NABU_EXPERIMENT_GROUP).unwrap();
        assert!(matches!(
            group.reference().validated(),
            Err(NamespaceError::InvalidReference(_))
        ));
    }

    #[test]
    fn parse_reads_bracketed_indices() {
        let language = Language::core().unwrap();
        let reference =
            Reference::parse("blockchain.ux.user.nabu.experiment[a.b].group", &language).unwrap();
        assert_eq!(reference.tag().id(), ids::NABU_EXPERIMENT_GROUP);
        assert_eq!(reference.index(ids::NABU_EXPERIMENT_ID), Some("a.b"));
        assert_eq!(reference.to_string(), "blockchain.ux.user.nabu.experiment[a.b].group");

        assert!(matches!(
            Reference::parse("blockchain.user[x].id", &language),
            Err(NamespaceError::InvalidReference(_))
        ));
        assert!(Reference::parse("blockchain..user", &language).is_err());
        assert!(Reference::parse("blockchain.ux.user.nabu.experiment[x", &language).is_err());
    }

    #[test]
    fn identity_ignores_non_index_context() {
        let language = Language::core().unwrap();
        let user = language.resolve(ids::USER_ID).unwrap();
        let plain = user.reference();
        let decorated = Reference::new(user, Context::new().with("note", json!(true)));
        assert_eq!(plain, decorated);
        assert_eq!(decorated.context().get("note"), Some(&json!(true)));
    }

    #[test]
    fn matches_pins_only_pattern_indices() {
        let language = Language::core().unwrap();
        let experiment = language.resolve(ids::NABU_EXPERIMENT).unwrap();
        let group = language.resolve(ids::NABU_EXPERIMENT_GROUP).unwrap();

        let event = group.key().with(ids::NABU_EXPERIMENT_ID, "x").reference();
        assert!(event.matches(&group.reference()));
        assert!(event.matches(&experiment.key().at("x").child("group").unwrap().reference()));
        assert!(!event.matches(&experiment.key().at("y").child("group").unwrap().reference()));
        assert!(!event.matches(&experiment.reference()));
    }
}
