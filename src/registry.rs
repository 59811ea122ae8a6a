//! Variable registry interface
//!
//! The registry owns the authoritative in-memory variable table. Storages
//! never write to it directly; they report every loaded or polled record
//! through [`VariableSink`].

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::types::{list_element, SerializedValue, LIST_SEPARATOR};

/// Receives records read back from a storage
pub trait VariableSink: Send + Sync {
    /// Called once per row during bulk load and once per newly observed row
    /// while polling. `value` is `None` for a deletion.
    fn variable_loaded(&self, name: &str, value: Option<&SerializedValue>, source: &str);
}

/// Simple in-memory variable table
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    variables: RwLock<BTreeMap<String, (SerializedValue, String)>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<SerializedValue> {
        self.variables.read().get(name).map(|(value, _)| value.clone())
    }

    /// Name of the storage the variable was last loaded from
    pub fn source_of(&self, name: &str) -> Option<String> {
        self.variables.read().get(name).map(|(_, source)| source.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.variables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.read().is_empty()
    }

    /// All variables, sorted by name
    pub fn snapshot(&self) -> Vec<(String, SerializedValue)> {
        self.variables
            .read()
            .iter()
            .map(|(name, (value, _))| (name.clone(), value.clone()))
            .collect()
    }

    /// Elements of the list `prefix::*`, sorted by name
    pub fn list(&self, prefix: &str) -> Vec<(String, SerializedValue)> {
        let start = list_element(prefix, "");
        self.variables
            .read()
            .range(start.clone()..)
            .take_while(|(name, _)| name.starts_with(&start))
            .filter(|(name, _)| !name[start.len()..].contains(LIST_SEPARATOR))
            .map(|(name, (value, _))| (name.clone(), value.clone()))
            .collect()
    }
}

impl VariableSink for MemoryRegistry {
    fn variable_loaded(&self, name: &str, value: Option<&SerializedValue>, source: &str) {
        let mut variables = self.variables.write();
        match value {
            Some(value) => {
                variables.insert(name.to_string(), (value.clone(), source.to_string()));
            }
            None => {
                variables.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_delete() {
        let registry = MemoryRegistry::new();
        let value = SerializedValue::new("int", vec![1]);
        registry.variable_loaded("a", Some(&value), "default");
        assert_eq!(registry.get("a"), Some(value));
        assert_eq!(registry.source_of("a").as_deref(), Some("default"));

        registry.variable_loaded("a", None, "default");
        assert!(!registry.contains("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_elements() {
        let registry = MemoryRegistry::new();
        let value = SerializedValue::new("int", vec![1]);
        for name in ["scores::1", "scores::2", "scores::nested::1", "scoresx", "other::1"] {
            registry.variable_loaded(name, Some(&value), "default");
        }

        let names: Vec<String> = registry.list("scores").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["scores::1", "scores::2"]);
    }
}
