//! Operations: the unit of transport, persistence and replay.
//!
//! In memory an operation is the tagged [`Operation`] enum. On the wire and
//! in the operation log it travels as the flat [`RawOperation`] record, and
//! every conversion back goes through validation, so a malformed payload is
//! rejected with `InvalidOperation` before it can reach a document.

use serde::{Deserialize, Serialize};

use crate::crdt::types::{NodeId, SiteId};
use crate::error::CrdtError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
        }
    }
}

/// A single replicated edit.
///
/// Uniquely identified by `(site_id, counter)`; see [`Operation::id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RawOperation", try_from = "RawOperation")]
pub enum Operation {
    Insert {
        /// Id of the new node, equal to the operation id
        id: NodeId,
        after: Option<NodeId>,
        value: char,
    },
    Delete {
        /// Operation id
        id: NodeId,
        target: NodeId,
    },
}

impl Operation {
    pub fn insert(id: NodeId, after: Option<NodeId>, value: char) -> Self {
        Operation::Insert { id, after, value }
    }

    pub fn delete(id: NodeId, target: NodeId) -> Self {
        Operation::Delete { id, target }
    }

    pub fn id(&self) -> &NodeId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => id,
        }
    }

    pub fn site_id(&self) -> &str {
        &self.id().site_id
    }

    pub fn counter(&self) -> u64 {
        self.id().counter
    }

    pub fn op_type(&self) -> OperationType {
        match self {
            Operation::Insert { .. } => OperationType::Insert,
            Operation::Delete { .. } => OperationType::Delete,
        }
    }

    /// The node that must already exist locally before this operation can
    /// be applied, if any.
    pub fn dependency(&self) -> Option<&NodeId> {
        match self {
            Operation::Insert { after, .. } => after.as_ref(),
            Operation::Delete { target, .. } => Some(target),
        }
    }
}

/// Flat wire/storage shape of an operation.
///
/// Every field that only one variant needs is optional here; `TryFrom`
/// enforces which ones are required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub site_id: SiteId,
    pub counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<char>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<NodeId>,
}

impl From<Operation> for RawOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Insert { id, after, value } => RawOperation {
                op_type: OperationType::Insert,
                site_id: id.site_id.clone(),
                counter: id.counter,
                node_id: Some(id),
                after_id: after,
                value: Some(value),
                target_id: None,
            },
            Operation::Delete { id, target } => RawOperation {
                op_type: OperationType::Delete,
                site_id: id.site_id.clone(),
                counter: id.counter,
                node_id: Some(id),
                after_id: None,
                value: None,
                target_id: Some(target),
            },
        }
    }
}

impl TryFrom<RawOperation> for Operation {
    type Error = CrdtError;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        if raw.site_id.is_empty() {
            return Err(CrdtError::InvalidOperation("empty site_id".into()));
        }
        if raw.counter == 0 {
            return Err(CrdtError::InvalidOperation(format!(
                "counter must start at 1 (site {})",
                raw.site_id
            )));
        }
        let id = NodeId::new(raw.site_id, raw.counter);
        if let Some(node_id) = &raw.node_id {
            if *node_id != id {
                return Err(CrdtError::InvalidOperation(format!(
                    "node_id {} does not match operation {}",
                    node_id, id
                )));
            }
        }

        match raw.op_type {
            OperationType::Insert => {
                let value = raw.value.ok_or_else(|| {
                    CrdtError::InvalidOperation(format!("insert {} has no value", id))
                })?;
                Ok(Operation::Insert {
                    id,
                    after: raw.after_id,
                    value,
                })
            }
            OperationType::Delete => {
                let target = raw.target_id.ok_or_else(|| {
                    CrdtError::InvalidOperation(format!("delete {} has no target_id", id))
                })?;
                Ok(Operation::Delete { id, target })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_accessors() {
        let op = Operation::insert(NodeId::new("a", 3), Some(NodeId::new("b", 1)), 'x');
        assert_eq!(op.site_id(), "a");
        assert_eq!(op.counter(), 3);
        assert_eq!(op.op_type(), OperationType::Insert);
        assert_eq!(op.dependency(), Some(&NodeId::new("b", 1)));

        let root = Operation::insert(NodeId::new("a", 1), None, 'y');
        assert_eq!(root.dependency(), None);

        let del = Operation::delete(NodeId::new("a", 4), NodeId::new("a", 3));
        assert_eq!(del.dependency(), Some(&NodeId::new("a", 3)));
    }

    #[test]
    fn test_json_shape() {
        let op = Operation::delete(NodeId::new("s1", 2), NodeId::new("s2", 7));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "delete");
        assert_eq!(value["site_id"], "s1");
        assert_eq!(value["counter"], 2);
        assert_eq!(value["target_id"]["site_id"], "s2");
        assert!(value.get("value").is_none());
    }

    #[test]
    fn test_insert_without_value_is_rejected() {
        let json = r#"{"type":"insert","site_id":"a","counter":1}"#;
        let err = serde_json::from_str::<Operation>(json).unwrap_err();
        assert!(err.to_string().contains("has no value"));

        let raw: RawOperation = serde_json::from_str(json).unwrap();
        let err = Operation::try_from(raw).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_delete_without_target_is_rejected() {
        let raw = RawOperation {
            op_type: OperationType::Delete,
            site_id: "a".into(),
            counter: 2,
            node_id: None,
            after_id: None,
            value: None,
            target_id: None,
        };
        assert!(Operation::try_from(raw).is_err());
    }

    #[test]
    fn test_mismatched_node_id_is_rejected() {
        let raw = RawOperation {
            op_type: OperationType::Insert,
            site_id: "a".into(),
            counter: 2,
            node_id: Some(NodeId::new("a", 3)),
            after_id: None,
            value: Some('q'),
            target_id: None,
        };
        assert!(Operation::try_from(raw).is_err());
    }

    #[test]
    fn test_zero_counter_is_rejected() {
        let json = r#"{"type":"insert","site_id":"a","counter":0,"value":"x"}"#;
        assert!(serde_json::from_str::<Operation>(json).is_err());
    }
}
