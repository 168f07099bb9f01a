//! In-memory key-value store fed by committed log entries.
//!
//! The store only ever changes through [`Store::apply`] (committed
//! entries) or [`Store::recovery`] (a snapshot payload).  Reads are served
//! directly from memory.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("cannot decode store payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cannot encode store payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyNode {
    pub key: String,
    pub value: String,
    pub created_index: u64,
    pub modified_index: u64,
}

/// The result of a read or an applied mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub action: &'static str,
    pub node: KeyNode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<KeyNode>,
}

/// A mutation carried in a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Op {
    Put { key: String, value: String },
    Delete { key: String },
}

/// A client proposal.  `id` lets the proposing node match the applied
/// entry back to the waiting request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    nodes: BTreeMap<String, KeyNode>,
    #[serde(default)]
    index: u64,
}

/// The replicated key space.
#[derive(Debug, Default)]
pub struct Store {
    state: RwLock<State>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Index of the last applied entry.
    pub fn index(&self) -> u64 {
        self.read().index
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().nodes.is_empty()
    }

    pub fn get(&self, key: &str) -> Result<Event, StoreError> {
        let key = normalize_key(key);
        let state = self.read();
        let node = state
            .nodes
            .get(&key)
            .cloned()
            .ok_or(StoreError::KeyNotFound(key))?;
        Ok(Event {
            action: "get",
            node,
            prev_node: None,
        })
    }

    /// Apply a committed mutation at log position `index`.
    pub fn apply(&self, index: u64, op: &Op) -> Result<Event, StoreError> {
        let mut state = self.write();
        state.index = state.index.max(index);
        match op {
            Op::Put { key, value } => {
                let key = normalize_key(key);
                let prev = state.nodes.get(&key).cloned();
                let node = KeyNode {
                    key: key.clone(),
                    value: value.clone(),
                    created_index: prev.as_ref().map_or(index, |p| p.created_index),
                    modified_index: index,
                };
                state.nodes.insert(key, node.clone());
                Ok(Event {
                    action: "set",
                    node,
                    prev_node: prev,
                })
            }
            Op::Delete { key } => {
                let key = normalize_key(key);
                let prev = state
                    .nodes
                    .remove(&key)
                    .ok_or_else(|| StoreError::KeyNotFound(key.clone()))?;
                let node = KeyNode {
                    key,
                    value: String::new(),
                    created_index: prev.created_index,
                    modified_index: index,
                };
                Ok(Event {
                    action: "delete",
                    node,
                    prev_node: Some(prev),
                })
            }
        }
    }

    /// Serialize the whole store for a snapshot.
    pub fn save(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(&*self.read()).map_err(StoreError::Encode)
    }

    /// Replace the whole store with a snapshot payload.
    pub fn recovery(&self, data: &[u8]) -> Result<(), StoreError> {
        let restored: State = serde_json::from_slice(data).map_err(StoreError::Decode)?;
        *self.write() = restored;
        Ok(())
    }
}

/// Keys are absolute: `foo` and `/foo` name the same key.
fn normalize_key(key: &str) -> String {
    format!("/{}", key.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str) -> Op {
        Op::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_put_then_get() {
        let store = Store::new();
        let event = store.apply(3, &put("foo", "bar")).unwrap();
        assert_eq!(event.action, "set");
        assert_eq!(event.node.key, "/foo");
        assert!(event.prev_node.is_none());

        let got = store.get("/foo").unwrap();
        assert_eq!(got.node.value, "bar");
        assert_eq!(got.node.modified_index, 3);
        assert_eq!(store.index(), 3);
    }

    #[test]
    fn test_overwrite_keeps_created_index() {
        let store = Store::new();
        store.apply(1, &put("k", "v1")).unwrap();
        let event = store.apply(2, &put("k", "v2")).unwrap();
        assert_eq!(event.node.created_index, 1);
        assert_eq!(event.node.modified_index, 2);
        assert_eq!(event.prev_node.unwrap().value, "v1");
    }

    #[test]
    fn test_delete() {
        let store = Store::new();
        store.apply(1, &put("k", "v")).unwrap();
        let event = store
            .apply(2, &Op::Delete { key: "k".into() })
            .unwrap();
        assert_eq!(event.action, "delete");
        assert!(store.get("k").is_err());

        let err = store
            .apply(3, &Op::Delete { key: "k".into() })
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound(k) if k == "/k"));
        assert_eq!(store.index(), 3);
    }

    #[test]
    fn test_save_and_recovery() {
        let store = Store::new();
        store.apply(1, &put("a", "1")).unwrap();
        store.apply(2, &put("b", "2")).unwrap();
        let data = store.save().unwrap();

        let restored = Store::new();
        restored.apply(1, &put("stale", "x")).unwrap();
        restored.recovery(&data).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.index(), 2);
        assert!(restored.get("stale").is_err());
        assert_eq!(restored.get("b").unwrap().node.value, "2");
    }

    #[test]
    fn test_recovery_rejects_garbage() {
        let store = Store::new();
        assert!(matches!(
            store.recovery(b"not json"),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let req = Request {
            id: 9,
            op: put("k", "v"),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "put");
        assert_eq!(json["id"], 9);
        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
