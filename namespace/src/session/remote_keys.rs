//! String keys a [`Reference`] is looked up under in remote configuration.
//!
//! Remote payloads predate the tag taxonomy, so one reference answers to
//! several spellings. The order below is a fixed contract with those payloads.

use crate::tag::Reference;

/// Prefix of locally overridden ("important") entries.
pub const IMPORTANT: &str = "!";

const APP_CONFIGURATION_PREFIX: &str = "blockchain_app_configuration";
const FEATURE_FLAG_PREFIX: &str = "ios_ff";
const PLATFORM_PREFIX: &str = "ios";
const IS_ENABLED_SUFFIX: &str = "_is_enabled";

/// `!a.b[x].c`
pub fn important(reference: &Reference) -> String {
    format!("{}{}", IMPORTANT, reference.string())
}

/// `a_b_x_c`: lineage names joined by `_`, each collection followed by its index.
pub fn remote(reference: &Reference) -> String {
    let mut lineage: Vec<_> = reference.tag().lineage().collect();
    lineage.reverse();
    let mut components = Vec::with_capacity(lineage.len());
    for tag in &lineage {
        components.push(tag.name().to_string());
        let index = tag
            .collection_id()
            .and_then(|id| reference.index(id.id()).map(str::to_string));
        if let Some(index) = index {
            components.push(index);
        }
    }
    components.join("_")
}

pub fn feature_flag(reference: &Reference) -> String {
    remote(reference).replace(APP_CONFIGURATION_PREFIX, FEATURE_FLAG_PREFIX)
}

pub fn feature_flag_without_suffix(reference: &Reference) -> String {
    feature_flag(reference).replace(IS_ENABLED_SUFFIX, "")
}

pub fn platform_without_suffix(reference: &Reference) -> String {
    remote(reference)
        .replace(APP_CONFIGURATION_PREFIX, PLATFORM_PREFIX)
        .replace(IS_ENABLED_SUFFIX, "")
}

/// The plain dotted reference, which is how defaults are keyed.
pub fn default(reference: &Reference) -> String {
    reference.string().to_string()
}

/// Every candidate key, highest precedence first.
pub fn candidates(reference: &Reference) -> [String; 6] {
    [
        important(reference),
        remote(reference),
        feature_flag(reference),
        feature_flag_without_suffix(reference),
        platform_without_suffix(reference),
        default(reference),
    ]
}
