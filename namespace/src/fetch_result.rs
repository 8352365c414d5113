use std::any::type_name;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tag::Reference;

/// Which component produced a [`FetchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    State,
    RemoteConfiguration,
    App,
}

/// Provenance attached to every result, for debugging rather than branching.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub reference: Reference,
    pub source: Source,
}

impl Metadata {
    pub fn new(reference: Reference, source: Source) -> Self {
        Self { reference, source }
    }
}

/// Typed read failure. Absence is an expected outcome, not an exceptional one.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// No value under any resolution path.
    KeyDoesNotExist(Reference),
    /// Remote configuration has not completed its first fetch yet.
    NotSynchronized,
    Decoding(String),
    Other(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FetchError::KeyDoesNotExist(reference) => {
                write!(f, "Key does not exist: {}", reference)
            }
            FetchError::NotSynchronized => {
                write!(f, "Remote configuration is not synchronized")
            }
            FetchError::Decoding(msg) => write!(f, "Decoding error: {}", msg),
            FetchError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

pub(crate) fn decode<T: DeserializeOwned>(
    value: Value,
    reference: &Reference,
) -> Result<T, FetchError> {
    serde_json::from_value(value).map_err(|error| {
        FetchError::Decoding(format!(
            "Error decoding {} as {}: {}",
            reference,
            type_name::<T>(),
            error
        ))
    })
}

/// Uniform envelope emitted by State and RemoteConfiguration reads and publishers.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Value(Value, Metadata),
    Error(FetchError, Metadata),
}

impl FetchResult {
    pub fn from_result(result: Result<Value, FetchError>, metadata: Metadata) -> Self {
        match result {
            Ok(value) => FetchResult::Value(value, metadata),
            Err(error) => FetchResult::Error(error, metadata),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            FetchResult::Value(value, _) => Some(value),
            FetchResult::Error(..) => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            FetchResult::Value(..) => None,
            FetchResult::Error(error, _) => Some(error),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            FetchResult::Value(_, metadata) | FetchResult::Error(_, metadata) => metadata,
        }
    }

    /// True only for a boolean `true` value.
    pub fn is_yes(&self) -> bool {
        matches!(self.value(), Some(Value::Bool(true)))
    }

    /// True only for a boolean `false` value.
    pub fn is_no(&self) -> bool {
        matches!(self.value(), Some(Value::Bool(false)))
    }

    pub fn get(self) -> Result<Value, FetchError> {
        match self {
            FetchResult::Value(value, _) => Ok(value),
            FetchResult::Error(error, _) => Err(error),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        match self {
            FetchResult::Value(value, metadata) => decode(value.clone(), &metadata.reference),
            FetchResult::Error(error, _) => Err(error.clone()),
        }
    }
}
