use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Runtime state requested for a data layer, ordered
/// `Unloaded < Loaded < Activated`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum DataLayerRuntimeState {
    #[default]
    Unloaded,
    Loaded,
    Activated,
}

#[derive(Debug, Clone)]
struct DataLayer {
    parent: Option<String>,
    state: DataLayerRuntimeState,
}

/// Registry of data layers for one world. Owned by the subsystem and passed
/// by reference wherever layer state is consulted.
#[derive(Debug, Default)]
pub struct DataLayerSubsystem {
    layers: HashMap<String, DataLayer>,
    epoch: u64,
}

impl DataLayerSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer, optionally nested under `parent`. Re-registering
    /// updates the parent and keeps the state.
    pub fn register(&mut self, name: impl Into<String>, parent: Option<&str>) {
        let parent = parent.map(str::to_owned);
        self.layers
            .entry(name.into())
            .and_modify(|layer| layer.parent.clone_from(&parent))
            .or_insert(DataLayer {
                parent,
                state: DataLayerRuntimeState::Unloaded,
            });
        self.epoch += 1;
    }

    /// Set a layer's own state. Unknown layers are registered on the fly.
    pub fn set_runtime_state(&mut self, name: &str, state: DataLayerRuntimeState) {
        let layer = self.layers.entry(name.to_owned()).or_insert(DataLayer {
            parent: None,
            state: DataLayerRuntimeState::Unloaded,
        });
        if layer.state != state {
            tracing::debug!(layer = name, ?state, "data layer state changed");
            layer.state = state;
            self.epoch += 1;
        }
    }

    pub fn runtime_state(&self, name: &str) -> DataLayerRuntimeState {
        self.layers
            .get(name)
            .map(|l| l.state)
            .unwrap_or_default()
    }

    /// A layer is only as active as its least active ancestor.
    pub fn effective_state(&self, name: &str) -> DataLayerRuntimeState {
        let mut state = DataLayerRuntimeState::Activated;
        let mut current = Some(name);
        let mut depth = 0;
        while let Some(layer_name) = current {
            let Some(layer) = self.layers.get(layer_name) else {
                return DataLayerRuntimeState::Unloaded;
            };
            state = state.min(layer.state);
            current = layer.parent.as_deref();
            depth += 1;
            if depth > self.layers.len() {
                tracing::warn!(layer = name, "data layer parent chain has a cycle");
                break;
            }
        }
        state
    }

    pub fn is_any_in_effective_state(
        &self,
        layers: &BTreeSet<String>,
        state: DataLayerRuntimeState,
    ) -> bool {
        layers.iter().any(|l| self.effective_state(l) == state)
    }

    /// Advanced on every registration or state change.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }
}
