use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc::{error::TrySendError, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Bat,
    Counter,
    Inverter,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bat => "bat",
            Self::Counter => "counter",
            Self::Inverter => "inverter",
        };
        f.write_str(name)
    }
}

/// Battery reading. Positive power charges the battery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatState {
    pub power: f64,
    pub soc: f64,
    pub imported: f64,
    pub exported: f64,
}

/// Inverter reading. Production is negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InverterState {
    pub power: f64,
    pub exported: f64,
}

/// Grid meter reading. Positive power is drawn from the grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub power: f64,
    pub powers: [f64; 3],
    pub imported: f64,
    pub exported: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ComponentState {
    Bat(BatState),
    Counter(CounterState),
    Inverter(InverterState),
}

impl ComponentState {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Self::Bat(_) => ComponentKind::Bat,
            Self::Counter(_) => ComponentKind::Counter,
            Self::Inverter(_) => ComponentKind::Inverter,
        }
    }
}

/// Destination for published component states. Last write wins.
pub trait ValueSink: Send + Sync {
    fn set(&self, component_id: u32, state: ComponentState);
}

/// Last-value cache read by downstream consumers
#[derive(Clone, Default)]
pub struct ValueStore {
    values: Arc<Mutex<HashMap<(ComponentKind, u32), ComponentState>>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ComponentKind, component_id: u32) -> Option<ComponentState> {
        self.lock().get(&(kind, component_id)).copied()
    }

    /// All states sorted by kind then id
    pub fn snapshot(&self) -> Vec<(ComponentKind, u32, ComponentState)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(&(kind, id), state)| (kind, id, *state))
            .collect();
        all.sort_by_key(|&(kind, id, _)| (kind, id));
        all
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(ComponentKind, u32), ComponentState>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ValueSink for ValueStore {
    fn set(&self, component_id: u32, state: ComponentState) {
        self.lock().insert((state.kind(), component_id), state);
    }
}

/// Forwards states over a channel, dropping them when the receiver lags
#[derive(Clone)]
pub struct ChannelSink {
    sender: Sender<(u32, ComponentState)>,
}

impl ChannelSink {
    pub fn new(sender: Sender<(u32, ComponentState)>) -> Self {
        Self { sender }
    }
}

impl ValueSink for ChannelSink {
    fn set(&self, component_id: u32, state: ComponentState) {
        match self.sender.try_send((component_id, state)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("State channel full, dropping update for component {component_id}")
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("State channel closed, dropping update for component {component_id}")
            }
        }
    }
}
