//! Remote values that vary with the experiment group the user is assigned to.
//!
//! A value of the shape
//! `{"{returns}": {"experiment": {"<id>": {"<group>": v}}}, "default": d}`
//! resolves to `v` for the user's group in experiment `<id>`, or to `d`.

use serde_json::{Map, Value};

use super::State;
use crate::ids;
use crate::tag::{Context, Reference};

pub const RETURNS: &str = "{returns}";
pub const DEFAULT: &str = "default";
const EXPERIMENT: &str = "experiment";

/// Replaces every experiment-shaped object inside `value`, at any depth.
pub fn resolve(value: Value, state: &State) -> Value {
    match value {
        Value::Object(object) if object.contains_key(RETURNS) => resolve_object(object, state),
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .map(|(key, value)| (key, resolve(value, state)))
                .collect(),
        ),
        Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(|value| resolve(value, state))
                .collect(),
        ),
        other => other,
    }
}

fn resolve_object(object: Map<String, Value>, state: &State) -> Value {
    match assigned(&object, state) {
        Ok(value) => value,
        Err(reason) => match object.get(DEFAULT) {
            Some(default) => default.clone(),
            None => {
                log::warn!("Unable to resolve experiment: {}", reason);
                Value::Object(object)
            }
        },
    }
}

fn assigned(object: &Map<String, Value>, state: &State) -> Result<Value, String> {
    let experiment = object
        .get(RETURNS)
        .and_then(|returns| returns.get(EXPERIMENT))
        .and_then(Value::as_object)
        .ok_or_else(|| format!("Expected an '{}' object in {}", EXPERIMENT, RETURNS))?;

    let mut entries = experiment.iter();
    let (id, groups) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => return Err(format!("Expected 1 experiment, got {}", experiment.len())),
    };

    let group = group(id, state).ok_or_else(|| format!("No experiment for '{}'", id))?;
    groups
        .get(group.to_string())
        .cloned()
        .ok_or_else(|| format!("No experiment config for '{}'", id))
}

/// The group the signed-in user was assigned to in experiment `id`.
pub fn group(id: &str, state: &State) -> Option<i64> {
    let tag = state.language().resolve(ids::NABU_EXPERIMENT_GROUP).ok()?;
    let reference = Reference::new(tag, Context::new().with(ids::NABU_EXPERIMENT_ID, id));
    state.get_as::<i64>(&reference).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPreferences;
    use crate::tag::Language;
    use serde_json::json;
    use std::sync::Arc;

    fn state() -> State {
        let language = Language::core().unwrap();
        State::new(language, Arc::new(MemoryPreferences::new()), 8).unwrap()
    }

    fn assign(state: &State, id: &str, group: i64) {
        let tag = state.language().resolve(ids::NABU_EXPERIMENT_GROUP).unwrap();
        state.set(
            Reference::new(tag, Context::new().with(ids::NABU_EXPERIMENT_ID, id)),
            group,
        );
    }

    fn value() -> Value {
        json!({
            "title": {
                "{returns}": { "experiment": { "banner": { "0": "Hello", "1": "Howdy" } } },
                "default": "Hi"
            },
            "static": 42
        })
    }

    #[test]
    fn resolves_the_assigned_group() {
        let state = state();
        assign(&state, "banner", 1);
        assert_eq!(
            resolve(value(), &state),
            json!({ "title": "Howdy", "static": 42 })
        );
    }

    #[test]
    fn falls_back_to_the_default() {
        let state = state();
        assert_eq!(resolve(value(), &state)["title"], json!("Hi"));

        assign(&state, "banner", 7);
        assert_eq!(resolve(value(), &state)["title"], json!("Hi"));
    }

    #[test]
    fn keeps_the_raw_value_without_a_default() {
        let state = state();
        let raw = json!({ "{returns}": { "experiment": { "a": {}, "b": {} } } });
        assert_eq!(resolve(raw.clone(), &state), raw);
    }
}
