//! Canonical mirror of the device's property state.
//!
//! The store has a single writer — the connection's receive task — and any
//! number of snapshot readers. Compound values are decomposed into child
//! entries inside the same write, so readers never observe a parent without
//! its matching children.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::schema::Schema;

/// A single applied property change, ready for listener dispatch.
#[derive(Debug, Clone)]
pub struct Change {
    pub key: String,
    pub value: Value,
}

#[derive(Default)]
struct StoreState {
    props: HashMap<String, Value>,
    /// Derived entries, fully owned by their parents.
    children: HashMap<String, Value>,
    /// Parent → currently materialized child keys, for shrink cleanup.
    child_index: HashMap<String, Vec<String>>,
    initialized: bool,
}

pub struct PropertyStore {
    schema: Arc<Schema>,
    split_compound: bool,
    state: RwLock<StoreState>,
    revision_tx: watch::Sender<u64>,
    revision_rx: watch::Receiver<u64>,
}

impl PropertyStore {
    pub fn new(schema: Arc<Schema>, split_compound: bool) -> Self {
        let (revision_tx, revision_rx) = watch::channel(0);
        Self {
            schema,
            split_compound,
            state: RwLock::new(StoreState::default()),
            revision_tx,
            revision_rx,
        }
    }

    /// True once the first full snapshot has been completely assembled.
    /// Typed accessors are meaningless before this point.
    pub fn initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Called by the connection state machine exactly when the first
    /// snapshot completes.
    pub fn mark_initialized(&self) {
        self.state.write().initialized = true;
    }

    /// Snapshot read of one key; child entries resolve here too.
    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.state.read();
        state
            .props
            .get(key)
            .or_else(|| state.children.get(key))
            .cloned()
    }

    /// Snapshot of every property, parents and derived children merged.
    pub fn all_properties(&self) -> HashMap<String, Value> {
        let state = self.state.read();
        let mut all = state.props.clone();
        for (key, value) in &state.children {
            all.insert(key.clone(), value.clone());
        }
        all
    }

    /// Ticks once per applied update; helpers use it to await "something
    /// changed" without polling.
    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.revision_rx.clone()
    }

    /// Merges an assembled full snapshot, overwriting prior values. Driven by
    /// the receive task only.
    pub fn apply_full(&self, batch: Map<String, Value>) -> Vec<Change> {
        let mut changes = Vec::new();
        {
            let mut state = self.state.write();
            for (key, value) in batch {
                self.apply_one(&mut state, &key, value, &mut changes);
            }
        }
        self.bump_revision(&changes);
        changes
    }

    /// Overwrites a single key. Driven by the receive task only.
    pub fn apply_delta(&self, key: &str, value: Value) -> Vec<Change> {
        let mut changes = Vec::new();
        {
            let mut state = self.state.write();
            self.apply_one(&mut state, key, value, &mut changes);
        }
        self.bump_revision(&changes);
        changes
    }

    fn bump_revision(&self, changes: &[Change]) {
        if !changes.is_empty() {
            self.revision_tx.send_if_modified(|rev| {
                *rev += 1;
                true
            });
        }
    }

    fn apply_one(&self, state: &mut StoreState, key: &str, value: Value, changes: &mut Vec<Change>) {
        let changed = state.props.get(key) != Some(&value);
        state.props.insert(key.to_string(), value.clone());
        if changed {
            changes.push(Change {
                key: key.to_string(),
                value: value.clone(),
            });
        }

        // Unknown keys stay in the canonical map verbatim; no decomposition,
        // no failure — firmware skew must never abort the session.
        if self.split_compound {
            if let Some(def) = self.schema.get(key) {
                if def.split && def.kind.is_compound() {
                    Self::refresh_children(state, key, &value, changes);
                }
            }
        }
    }

    fn refresh_children(
        state: &mut StoreState,
        parent: &str,
        value: &Value,
        changes: &mut Vec<Change>,
    ) {
        let derived = split_children(parent, value);
        let mut live_keys = Vec::with_capacity(derived.len());
        for (child_key, child_value) in derived {
            let changed = state.children.get(&child_key) != Some(&child_value);
            if changed {
                changes.push(Change {
                    key: child_key.clone(),
                    value: child_value.clone(),
                });
            }
            state.children.insert(child_key.clone(), child_value);
            live_keys.push(child_key);
        }
        if let Some(previous) = state.child_index.insert(parent.to_string(), live_keys.clone()) {
            for stale in previous {
                if !live_keys.contains(&stale) {
                    state.children.remove(&stale);
                }
            }
        }
    }
}

/// Pure decomposition of a compound value into addressable child entries:
/// `<parent>_<index>` for sequences, `<parent>_<field>` for mappings.
/// Recomputed in full on every parent update so the parent/child invariant
/// holds by construction.
pub fn split_children(parent: &str, value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| (format!("{parent}_{index}"), item.clone()))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(field, item)| (format!("{parent}_{field}"), item.clone()))
            .collect(),
        _ => Vec::new(),
    }
}
