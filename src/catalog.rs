// Sequence catalog: id <-> name/length mapping for one sequence database.
//
// Built once per database (from the binary container's embedded name
// records or from the tabular stream), immutable afterwards, and shared
// read-only by every consumer of records referencing that database.

use std::collections::HashMap;
use std::sync::Arc;

/// Bidirectional mapping between integer sequence ids and display
/// names/lengths for one sequence database.
#[derive(Debug, Clone, Default)]
pub struct SequenceCatalog {
    names: Vec<String>,
    lengths: Vec<u64>,
    by_name: HashMap<String, u32>,
}

impl SequenceCatalog {
    pub fn new() -> Self {
        SequenceCatalog::default()
    }

    /// Build a catalog from (name, length) pairs in id order.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut catalog = SequenceCatalog::new();
        for (name, len) in entries {
            catalog.push(name, len);
        }
        catalog
    }

    /// Append a sequence, assigning it the next id. Returns the id.
    ///
    /// Only used during construction; catalogs are never mutated once
    /// shared.
    pub fn push(&mut self, name: String, length: u64) -> u32 {
        let id = self.names.len() as u32;
        self.by_name.insert(name.clone(), id);
        self.names.push(name);
        self.lengths.push(length);
        id
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Resolve an id to its display name.
    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(|s| s.as_str())
    }

    /// Resolve an id to the sequence length.
    pub fn length(&self, id: u32) -> Option<u64> {
        self.lengths.get(id as usize).copied()
    }

    /// Resolve a display name to its id.
    pub fn id(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// All (id, name) pairs in id order.
    pub fn all_names(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (i as u32, n.as_str()))
    }

    /// Wrap in an `Arc` for sharing across threads.
    pub fn into_shared(self) -> Arc<SequenceCatalog> {
        Arc::new(self)
    }
}
