use std::fmt;

use crate::fetch_result::FetchError;

#[derive(Debug, Clone)]
pub enum NamespaceError {
    // Taxonomy errors
    NotFound(String),
    MissingChild {
        tag: String,
        name: String,
        children: Vec<String>,
    },
    TypeMismatch {
        tag: String,
        expected: String,
    },
    NotDescendant {
        tag: String,
        ancestor: String,
    },
    AmbiguousDescendant {
        tag: String,
        options: Vec<String>,
    },
    UndeclaredDescendant {
        tag: String,
        keys: Vec<String>,
    },
    MissingValue {
        tag: String,
        path: String,
    },
    InvalidReference(String),
    InvalidLexicon(String),

    // Storage errors
    Storage(String),
    Serialization(String),

    // Runtime errors
    Configuration(String),
    Remote(String),
    Fetch(FetchError),
}

impl fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NamespaceError::NotFound(id) => write!(f, "'{}' does not exist in language", id),
            NamespaceError::MissingChild {
                tag,
                name,
                children,
            } => write!(
                f,
                "{} does not have a child '{}' - it has children: [{}]",
                tag,
                name,
                children.join(", ")
            ),
            NamespaceError::TypeMismatch { tag, expected } => {
                write!(f, "{} is not a {}", tag, expected)
            }
            NamespaceError::NotDescendant { tag, ancestor } => {
                write!(f, "{} is not an ancestor of {}", ancestor, tag)
            }
            NamespaceError::AmbiguousDescendant { tag, options } => write!(
                f,
                "Multiple declared descendants of {}: [{}]",
                tag,
                options.join(", ")
            ),
            NamespaceError::UndeclaredDescendant { tag, keys } => write!(
                f,
                "None of [{}] are declared children of {}",
                keys.join(", "),
                tag
            ),
            NamespaceError::MissingValue { tag, path } => {
                write!(f, "No value found at {} in {} data", path, tag)
            }
            NamespaceError::InvalidReference(msg) => write!(f, "Invalid reference: {}", msg),
            NamespaceError::InvalidLexicon(msg) => write!(f, "Invalid lexicon: {}", msg),

            NamespaceError::Storage(msg) => write!(f, "Storage error: {}", msg),
            NamespaceError::Serialization(msg) => write!(f, "Serialization error: {}", msg),

            NamespaceError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            NamespaceError::Remote(msg) => write!(f, "Remote configuration error: {}", msg),
            NamespaceError::Fetch(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for NamespaceError {}

pub type NamespaceResult<T> = Result<T, NamespaceError>;

impl From<std::io::Error> for NamespaceError {
    fn from(error: std::io::Error) -> Self {
        NamespaceError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for NamespaceError {
    fn from(error: serde_json::Error) -> Self {
        NamespaceError::Serialization(format!("JSON error: {}", error))
    }
}

impl From<FetchError> for NamespaceError {
    fn from(error: FetchError) -> Self {
        NamespaceError::Fetch(error)
    }
}
