//! Namespaced identifiers (`namespace:path`) used to register stages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespace applied when a key is parsed without one.
pub const DEFAULT_NAMESPACE: &str = "nebula";

/// Errors produced while building a [`NamespaceKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The namespace part is empty or contains a forbidden character.
    #[error("invalid namespace `{0}`")]
    InvalidNamespace(String),
    /// The path part is empty or contains a forbidden character.
    #[error("invalid path `{0}`")]
    InvalidPath(String),
}

/// A `namespace:path` identifier.
///
/// Namespaces accept `[a-z0-9_.-]`, paths additionally accept `/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespaceKey {
    namespace: String,
    path: String,
}

impl NamespaceKey {
    /// Builds a key from its two parts.
    pub fn new(namespace: &str, path: &str) -> Result<Self, KeyError> {
        if namespace.is_empty() || !namespace.chars().all(is_namespace_char) {
            return Err(KeyError::InvalidNamespace(namespace.to_string()));
        }
        if path.is_empty() || !path.chars().all(|c| is_namespace_char(c) || c == '/') {
            return Err(KeyError::InvalidPath(path.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            path: path.to_string(),
        })
    }

    /// Builds a key in [`DEFAULT_NAMESPACE`].
    pub fn nebula(path: &str) -> Result<Self, KeyError> {
        Self::new(DEFAULT_NAMESPACE, path)
    }

    /// The namespace part.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The path part.
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn is_namespace_char(c: char) -> bool {
    matches!(c, 'a'..='z' | '0'..='9' | '_' | '.' | '-')
}

impl FromStr for NamespaceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, path)) => Self::new(namespace, path),
            None => Self::nebula(s),
        }
    }
}

impl TryFrom<String> for NamespaceKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NamespaceKey> for String {
    fn from(key: NamespaceKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_namespace() {
        let key: NamespaceKey = "terrain:surface/noise".parse().unwrap();
        assert_eq!(key.namespace(), "terrain");
        assert_eq!(key.path(), "surface/noise");
        assert_eq!(key.to_string(), "terrain:surface/noise");
    }

    #[test]
    fn test_parse_without_namespace_uses_default() {
        let key: NamespaceKey = "lighting".parse().unwrap();
        assert_eq!(key.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(key, NamespaceKey::nebula("lighting").unwrap());
    }

    #[test]
    fn test_rejects_bad_characters() {
        assert_eq!(
            "Upper:case".parse::<NamespaceKey>(),
            Err(KeyError::InvalidNamespace("Upper".to_string()))
        );
        assert_eq!(
            NamespaceKey::new("ok", "spaces here"),
            Err(KeyError::InvalidPath("spaces here".to_string()))
        );
        assert!(NamespaceKey::new("a/b", "c").is_err());
        assert!("empty:".parse::<NamespaceKey>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let key = NamespaceKey::new("nebula", "features").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"nebula:features\"");
        let back: NamespaceKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<NamespaceKey>("\"Bad Key\"").is_err());
    }
}
