//! Schema definitions.
//!
//! A definition describes the fields carried in the `data` of every event or
//! action sent under a given identifier. Definitions are merged by field name
//! when the same identifier is published more than once.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which stream a definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Requests sent to a peer.
    Action,
    /// Notifications broadcast by a peer.
    Event,
}

impl Category {
    /// Both categories, actions first.
    pub const ALL: [Category; 2] = [Category::Action, Category::Event];

    /// The wire spelling of this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Action => "action",
            Category::Event => "event",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attribute of a payload. `name` is the merge key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Free-form type tag (`"number"`, `"string"`, ...).
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub unit: String,
}

impl Field {
    /// Creates a new field.
    pub fn new(
        name: impl Into<String>,
        field_type: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            unit: unit.into(),
        }
    }
}

/// Schema for one identifier.
///
/// Older peers spell `category` as `type` and `isArray` as `isarray`; both
/// spellings are accepted on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub identifier: String,
    #[serde(alias = "type")]
    pub category: Category,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(rename = "isArray", alias = "isarray", default)]
    pub is_array: bool,
}

impl Definition {
    /// Creates a definition with no fields.
    pub fn new(category: Category, identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            category,
            fields: Vec::new(),
            is_array: false,
        }
    }

    /// Sets the field list.
    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    /// Marks the payload as an array of records.
    pub fn with_array(mut self, is_array: bool) -> Self {
        self.is_array = is_array;
        self
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}
