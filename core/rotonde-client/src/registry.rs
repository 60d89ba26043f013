//! Definition storage.
//!
//! A [`DefinitionRegistry`] keeps the definitions of one category in
//! insertion order plus an identifier index. The index is rebuilt after every
//! mutation, which is O(n) per add; registries hold tens of identifiers.

use rotonde_types::{Category, Definition, Field};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Stores and indexes the definitions of one category.
#[derive(Debug, Default, Clone)]
pub struct DefinitionRegistry {
    definitions: Vec<Definition>,
    by_identifier: HashMap<String, usize>,
}

impl DefinitionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition, merging fields with any existing record.
    ///
    /// When the identifier is already known the stored record is replaced by
    /// `definition`, with its fields set to the existing fields followed by
    /// the new ones, deduplicated by name (first occurrence kept).
    /// Returns the stored record.
    pub fn add(&mut self, mut definition: Definition) -> &Definition {
        let index = match self.by_identifier.get(&definition.identifier) {
            Some(&index) => {
                definition.fields = union_by_name(&self.definitions[index].fields, definition.fields);
                self.definitions[index] = definition;
                index
            }
            None => {
                self.definitions.push(definition);
                self.definitions.len() - 1
            }
        };
        self.reindex();
        &self.definitions[index]
    }

    /// Removes a definition. Returns the removed record, if any.
    pub fn remove(&mut self, identifier: &str) -> Option<Definition> {
        let index = *self.by_identifier.get(identifier)?;
        let removed = self.definitions.remove(index);
        self.reindex();
        Some(removed)
    }

    /// Looks up a definition. A miss is logged, never an error.
    pub fn get(&self, identifier: &str) -> Option<&Definition> {
        let found = self
            .by_identifier
            .get(identifier)
            .map(|&index| &self.definitions[index]);
        if found.is_none() {
            debug!("unknown definition: {identifier}");
        }
        found
    }

    /// Returns whether the identifier is known, without logging.
    pub fn contains(&self, identifier: &str) -> bool {
        self.by_identifier.contains_key(identifier)
    }

    /// Calls `f` for every definition in insertion order.
    pub fn for_each(&self, f: impl FnMut(&Definition)) {
        self.definitions.iter().for_each(f);
    }

    /// Iterates definitions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Definition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn reindex(&mut self) {
        self.by_identifier = self
            .definitions
            .iter()
            .enumerate()
            .map(|(index, d)| (d.identifier.clone(), index))
            .collect();
    }
}

fn union_by_name(existing: &[Field], incoming: Vec<Field>) -> Vec<Field> {
    let mut seen = HashSet::new();
    existing
        .iter()
        .cloned()
        .chain(incoming)
        .filter(|field| seen.insert(field.name.clone()))
        .collect()
}

/// One registry per category.
#[derive(Debug, Default, Clone)]
pub struct CategoryRegistries {
    actions: DefinitionRegistry,
    events: DefinitionRegistry,
}

impl CategoryRegistries {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry holding definitions of `category`.
    pub fn get(&self, category: Category) -> &DefinitionRegistry {
        match category {
            Category::Action => &self.actions,
            Category::Event => &self.events,
        }
    }

    /// Mutable access to the registry holding definitions of `category`.
    pub fn get_mut(&mut self, category: Category) -> &mut DefinitionRegistry {
        match category {
            Category::Action => &mut self.actions,
            Category::Event => &mut self.events,
        }
    }

    /// Returns whether either category knows the identifier.
    pub fn knows(&self, identifier: &str) -> bool {
        Category::ALL
            .iter()
            .any(|&category| self.get(category).contains(identifier))
    }

    /// All definitions, actions first.
    pub fn all(&self) -> Vec<Definition> {
        self.actions.iter().chain(self.events.iter()).cloned().collect()
    }
}
