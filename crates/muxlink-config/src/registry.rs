//! Freezable kind registries.
//!
//! Registries are wired once at bring-up and frozen before hot use;
//! duplicate kinds and post-freeze writes are configuration failures.

use crate::error::{ConfigError, Result};
use rustc_hash::FxHashMap;

/// Ordered map keyed by non-empty kind string.
pub struct KindRegistry<T> {
    name: &'static str,
    entries: FxHashMap<String, T>,
    order: Vec<String>,
    frozen: bool,
}

impl<T> KindRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: FxHashMap::default(),
            order: Vec::new(),
            frozen: false,
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, value: T) -> Result<()> {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{}: kind must be non-empty",
                self.name
            )));
        }
        if self.frozen {
            return Err(ConfigError::FrozenRegistry(self.name.to_string()));
        }
        if self.entries.contains_key(&kind) {
            return Err(ConfigError::DuplicateKind(kind));
        }
        self.order.push(kind.clone());
        self.entries.insert(kind, value);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&T> {
        self.entries.get(kind)
    }

    pub fn require(&self, kind: &str) -> Result<&T> {
        self.entries
            .get(kind)
            .ok_or_else(|| ConfigError::UnknownKind(format!("{}: {}", self.name, kind)))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Iterate entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.order
            .iter()
            .filter_map(|kind| self.entries.get(kind).map(|v| (kind.as_str(), v)))
    }

    /// Bring-up check: every entry whose self-reported kind differs from its
    /// registration key is a wiring mistake.
    pub fn verify_kinds(&self, kind_of: impl Fn(&T) -> Option<&str>) -> Result<()> {
        for (kind, value) in self.iter() {
            if let Some(own) = kind_of(value) {
                if own != kind {
                    return Err(ConfigError::ValidationError(format!(
                        "{}: entry registered as '{}' reports kind '{}'",
                        self.name, kind, own
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = KindRegistry::new("test");
        registry.register("json", 1).unwrap();
        registry.register("text", 2).unwrap();
        assert_eq!(registry.get("json"), Some(&1));
        assert_eq!(registry.require("text").unwrap(), &2);
        assert!(registry.require("image").is_err());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let mut registry = KindRegistry::new("test");
        registry.register("json", 1).unwrap();
        let err = registry.register("json", 2).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateKind(_)));
    }

    #[test]
    fn test_empty_kind_rejected() {
        let mut registry = KindRegistry::new("test");
        assert!(registry.register("", 1).is_err());
    }

    #[test]
    fn test_freeze_blocks_writes() {
        let mut registry = KindRegistry::new("test");
        registry.register("json", 1).unwrap();
        registry.freeze();
        assert!(matches!(
            registry.register("text", 2),
            Err(ConfigError::FrozenRegistry(_))
        ));
        assert_eq!(registry.get("json"), Some(&1));
    }

    #[test]
    fn test_iteration_preserves_registration_order() {
        let mut registry = KindRegistry::new("test");
        for kind in ["c", "a", "b"] {
            registry.register(kind, kind.len()).unwrap();
        }
        let kinds: Vec<&str> = registry.iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_verify_kinds_detects_mismatch() {
        struct Entry {
            kind: &'static str,
        }
        let mut registry = KindRegistry::new("test");
        registry.register("json", Entry { kind: "json" }).unwrap();
        registry.register("text", Entry { kind: "plain" }).unwrap();
        assert!(registry.verify_kinds(|e| Some(e.kind)).is_err());
    }
}
