use std::collections::btree_map;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Values bound to indexing tags, keyed by tag id.
///
/// A reference to a collection member carries its index here under the
/// collection's `id` tag, e.g. `blockchain.ux.user.nabu.experiment.id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(id.into(), value.into());
    }

    pub fn with(mut self, id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(id, value);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// A copy of this context with every entry of `other` layered on top.
    pub fn merged(&self, other: &Context) -> Self {
        let mut merged = self.clone();
        merged.extend(other);
        merged
    }

    pub fn extend(&mut self, other: &Context) {
        self.0
            .extend(other.0.iter().map(|(id, value)| (id.clone(), value.clone())));
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<BTreeMap<String, Value>> for Context {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(id, value)| (id.into(), value.into()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a Context {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merged_prefers_the_other_side() {
        let base = Context::new().with("a", 1).with("b", 2);
        let top = Context::new().with("b", 3);
        let merged = base.merged(&top);
        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(3)));
        assert_eq!(base.get("b"), Some(&json!(2)));
    }

    #[test]
    fn serializes_as_a_plain_object() {
        let context = Context::new().with("blockchain.user.id", "alice");
        assert_eq!(
            serde_json::to_value(&context).unwrap(),
            json!({ "blockchain.user.id": "alice" })
        );
    }
}
