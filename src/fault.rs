use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::PollError;
use crate::value_store::ComponentKind;

/// Static identity of a component, used to attribute faults
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentInfo {
    pub device_id: u32,
    pub component_id: u32,
    pub kind: ComponentKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultOrigin {
    Device(u32),
    Component(ComponentInfo),
}

impl fmt::Display for FaultOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(id) => write!(f, "device {id}"),
            Self::Component(info) => write!(
                f,
                "device {} {} {} ({})",
                info.device_id, info.kind, info.component_id, info.name
            ),
        }
    }
}

/// Receives faults raised while polling. Must not block.
pub trait FaultReporter: Send + Sync {
    fn report(&self, origin: &FaultOrigin, error: &PollError);

    /// Called after `origin` polled successfully
    fn resolve(&self, _origin: &FaultOrigin) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub message: String,
    pub retryable: bool,
}

/// Logs faults and keeps the current fault of every origin
#[derive(Clone, Default)]
pub struct FaultStore {
    faults: Arc<Mutex<HashMap<FaultOrigin, Fault>>>,
}

impl FaultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, origin: &FaultOrigin) -> Option<Fault> {
        self.lock().get(origin).cloned()
    }

    pub fn active(&self) -> Vec<(FaultOrigin, Fault)> {
        self.lock()
            .iter()
            .map(|(origin, fault)| (origin.clone(), fault.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FaultOrigin, Fault>> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FaultReporter for FaultStore {
    fn report(&self, origin: &FaultOrigin, error: &PollError) {
        if error.is_retryable() {
            tracing::warn!("{origin}: {error}");
        } else {
            tracing::error!("{origin}: {error}");
        }
        self.lock().insert(
            origin.clone(),
            Fault {
                message: error.to_string(),
                retryable: error.is_retryable(),
            },
        );
    }

    fn resolve(&self, origin: &FaultOrigin) {
        if self.lock().remove(origin).is_some() {
            tracing::info!("{origin}: recovered");
        }
    }
}
