//! Core types for varstore

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Separator between a list variable's prefix and its element index
pub const LIST_SEPARATOR: &str = "::";

/// Suffix token that denotes "the whole list"
pub const LIST_WILDCARD: &str = "*";

/// Patterns treated as "accept every name"
pub const MATCH_ALL_PATTERNS: &[&str] = &[".*", ".+", "^.*$", "(.*)"];

/// Whether `name` is the wildcard form of a list (`prefix::*`)
pub fn is_list_wildcard(name: &str) -> bool {
    name.strip_suffix(LIST_WILDCARD)
        .is_some_and(|rest| rest.ends_with(LIST_SEPARATOR))
}

/// The list prefix of `name` (`prefix` for `prefix::1`), if it is a list entry
pub fn list_prefix(name: &str) -> Option<&str> {
    name.rfind(LIST_SEPARATOR).map(|idx| &name[..idx])
}

/// Build the name of a list element
pub fn list_element(prefix: &str, index: &str) -> String {
    format!("{}{}{}", prefix, LIST_SEPARATOR, index)
}

/// Opaque serialized form of a variable value
///
/// Produced and consumed by the host's serialization codec; the storage
/// engine never looks inside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedValue {
    /// Codec type tag (e.g. "int", "text", "location")
    #[serde(rename = "type")]
    pub type_tag: String,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl SerializedValue {
    pub fn new(type_tag: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload: payload.into(),
        }
    }
}

/// The unit of durability: a named value, or a tombstone when `value` is `None`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedRecord {
    pub name: String,
    pub value: Option<SerializedValue>,
}

impl SerializedRecord {
    /// An upsert record
    pub fn value(name: impl Into<String>, value: SerializedValue) -> Self {
        Self {
            name: name.into(),
            value: Some(value),
        }
    }

    /// A deletion record
    pub fn tombstone(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A row as read back from a relational backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRow {
    pub name: String,
    /// `None` for tombstone rows
    pub type_tag: Option<String>,
    /// `None` for tombstone rows
    pub payload: Option<Vec<u8>>,
    /// Monotonic sequence assigned by the backend
    pub row_id: i64,
}

impl PersistedRow {
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none() || self.type_tag.is_none()
    }

    /// Decode into the record handed to the variable registry
    pub fn into_record(self) -> SerializedRecord {
        match (self.type_tag, self.payload) {
            (Some(type_tag), Some(payload)) => SerializedRecord::value(
                self.name,
                SerializedValue { type_tag, payload },
            ),
            _ => SerializedRecord::tombstone(self.name),
        }
    }
}

/// Name filter for a storage
///
/// Match-everything patterns collapse into "no filtering" so the hot path
/// does not run a regex for every mutation.
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: Option<String>,
    regex: Option<Regex>,
}

impl NamePattern {
    /// Accepts every name
    pub fn any() -> Self {
        Self {
            source: None,
            regex: None,
        }
    }

    /// Compile a pattern; the whole name must match
    pub fn parse(pattern: Option<&str>) -> crate::Result<Self> {
        let pattern = match pattern.map(str::trim) {
            None | Some("") => return Ok(Self::any()),
            Some(p) if MATCH_ALL_PATTERNS.contains(&p) => return Ok(Self::any()),
            Some(p) => p,
        };

        let regex = Regex::new(&format!("^(?:{})$", pattern))?;
        Ok(Self {
            source: Some(pattern.to_string()),
            regex: Some(regex),
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.regex {
            None => true,
            Some(regex) => regex.is_match(name),
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.regex.is_none()
    }

    /// The configured pattern, `None` when it accepts everything
    pub fn as_str(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

impl Default for NamePattern {
    fn default() -> Self {
        Self::any()
    }
}
