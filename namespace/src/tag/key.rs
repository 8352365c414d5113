use serde_json::Value;

use super::{Context, Reference, Tag};
use crate::errors::NamespaceResult;

/// Immutable builder accumulating the context of a [`Reference`].
///
/// `language.resolve("blockchain.ux.user.nabu.experiment")?.key().at("x").child("group")?`
/// addresses `blockchain.ux.user.nabu.experiment[x].group`.
#[derive(Debug, Clone)]
pub struct Key {
    tag: Tag,
    context: Context,
}

impl Key {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            context: Context::new(),
        }
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Binds `value` as the index of the current tag when it is a collection,
    /// otherwise as the value of the current tag itself.
    pub fn at(&self, value: impl Into<Value>) -> Self {
        let id = self
            .tag
            .collection_id()
            .map(|id| id.id().to_string())
            .unwrap_or_else(|| self.tag.id().to_string());
        self.with(id, value)
    }

    pub fn with(&self, id: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            tag: self.tag.clone(),
            context: self.context.clone().with(id, value),
        }
    }

    pub fn child(&self, name: &str) -> NamespaceResult<Self> {
        Ok(Self {
            tag: self.tag.child(name)?,
            context: self.context.clone(),
        })
    }

    /// Moves down a relative dot-path, keeping the accumulated context.
    pub fn descendant(&self, path: &str) -> NamespaceResult<Self> {
        Ok(Self {
            tag: self
                .tag
                .descendant(path.split('.').filter(|name| !name.is_empty()))?,
            context: self.context.clone(),
        })
    }

    pub fn reference(&self) -> Reference {
        Reference::new(self.tag.clone(), self.context.clone())
    }
}
