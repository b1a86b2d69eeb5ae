//! # Capability Properties
//!
//! Property sets attached to every registered capability. Values form a closed
//! sum type so matching code never has to guess at an untyped value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Categories a device belongs to (string or list of strings).
pub const DEVICE_CATEGORY: &str = "DEVICE_CATEGORY";
/// Identifier of a driver; every driver capability must carry one.
pub const DRIVER_ID: &str = "DRIVER_ID";
/// Free-form description of a device.
pub const DEVICE_DESCRIPTION: &str = "DEVICE_DESCRIPTION";
/// Serial number of a device.
pub const DEVICE_SERIAL: &str = "DEVICE_SERIAL";

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(i64),
    String(String),
    StringList(Vec<String>),
}

impl PropertyValue {
    /// Returns `true` if this value equals `item` or, for lists, holds it.
    pub fn contains(&self, item: &str) -> bool {
        match self {
            PropertyValue::String(s) => s == item,
            PropertyValue::StringList(items) => items.iter().any(|s| s == item),
            _ => false,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Number(n) => write!(f, "{}", n),
            PropertyValue::String(s) => write!(f, "{}", s),
            PropertyValue::StringList(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        PropertyValue::StringList(value)
    }
}

impl From<&[&str]> for PropertyValue {
    fn from(value: &[&str]) -> Self {
        PropertyValue::StringList(value.iter().map(|s| s.to_string()).collect())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// An ordered, string-keyed property set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, PropertyValue>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<PropertyValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(PropertyValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Reads a list property. A plain string is promoted to a one-element list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(PropertyValue::StringList(items)) => items.clone(),
            Some(PropertyValue::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn get_number(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(PropertyValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(PropertyValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, filter: &Filter) -> bool {
        filter.matches(self)
    }
}

/// A property filter used when querying the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Any,
    Equals(String, PropertyValue),
    /// String equality or list membership.
    Contains(String, String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Filter::Any => true,
            Filter::Equals(key, value) => props.get(key) == Some(value),
            Filter::Contains(key, item) => props.get(key).is_some_and(|v| v.contains(item)),
            Filter::And(filters) => filters.iter().all(|f| f.matches(props)),
        }
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, "}}")
    }
}
