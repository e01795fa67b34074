//! Bridge between editor offsets and node ids.
//!
//! Editors speak in visible-character offsets; the document speaks in
//! [`NodeId`]s. The map is rebuilt with one pass over the visible nodes after
//! every change to visible content. Tombstones never appear in it.

use std::collections::HashMap;

use crate::crdt::document::Document;
use crate::crdt::types::NodeId;

#[derive(Debug, Clone, Default)]
pub struct PositionMap {
    id_to_index: HashMap<NodeId, usize>,
    index_to_id: Vec<NodeId>,
}

impl PositionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: &Document) -> Self {
        let mut map = PositionMap::new();
        map.rebuild(document);
        map
    }

    pub fn rebuild(&mut self, document: &Document) {
        self.index_to_id = document.visible_ids();
        self.id_to_index = self
            .index_to_id
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index))
            .collect();
    }

    /// The node immediately before visible offset `index`, used as the anchor
    /// of an insert at that offset. `None` for offset 0 or when `index` is
    /// past the end.
    pub fn get_id_before_index(&self, index: usize) -> Option<&NodeId> {
        index.checked_sub(1).and_then(|i| self.index_to_id.get(i))
    }

    pub fn get_id_at_index(&self, index: usize) -> Option<&NodeId> {
        self.index_to_id.get(index)
    }

    pub fn get_index_of_id(&self, id: &NodeId) -> Option<usize> {
        self.id_to_index.get(id).copied()
    }

    /// Number of visible characters
    pub fn len(&self) -> usize {
        self.index_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_to_id.is_empty()
    }
}
