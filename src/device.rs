use std::sync::Arc;

use crate::component::Component;
use crate::config::{ComponentConfig, DeviceConfig};
use crate::counter_store::CounterStore;
use crate::error::{PollError, Result};
use crate::fault::{FaultOrigin, FaultReporter};
use crate::modbus_client::Connector;
use crate::value_store::ValueSink;

/// Outcome of one polling cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Components that published fresh state
    pub polled: usize,
    /// Components whose update failed
    pub failed: usize,
    /// Whether the connection could be opened at all
    pub connected: bool,
}

/// All components of one device, polled over a single shared connection
pub struct DeviceSession {
    config: DeviceConfig,
    connector: Box<dyn Connector>,
    components: Vec<Component>,
    faults: Arc<dyn FaultReporter>,
}

impl DeviceSession {
    pub fn new(
        config: DeviceConfig,
        connector: Box<dyn Connector>,
        faults: Arc<dyn FaultReporter>,
    ) -> Self {
        Self {
            config,
            connector,
            components: Vec::new(),
            faults,
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn add_component(
        &mut self,
        config: &ComponentConfig,
        store: Arc<dyn CounterStore>,
        sink: Arc<dyn ValueSink>,
    ) -> Result<()> {
        if self
            .components
            .iter()
            .any(|c| c.info().component_id == config.id())
        {
            return Err(PollError::Configuration(format!(
                "device {} already has a component with id {}",
                self.config.id,
                config.id()
            )));
        }
        let component = Component::from_config(&self.config, config, store, sink);
        tracing::debug!(
            "Device {}: added {} component {}",
            self.config.id,
            component.info().kind,
            component.info().component_id
        );
        self.components.push(component);
        Ok(())
    }

    /// Opens the connection, updates every component in order and closes it again.
    ///
    /// A failing component is reported and skipped. Failing to connect is
    /// reported once for the whole device and nothing is published.
    pub async fn poll_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let device_origin = FaultOrigin::Device(self.config.id);

        let mut client = match self.connector.connect().await {
            Ok(client) => client,
            Err(e) => {
                self.faults.report(&device_origin, &e);
                return report;
            }
        };
        report.connected = true;
        self.faults.resolve(&device_origin);
        tracing::debug!("Reading {}", self.connector.describe());

        for component in &mut self.components {
            let origin = FaultOrigin::Component(component.info().clone());
            match component.update(client.as_mut()).await {
                Ok(()) => {
                    report.polled += 1;
                    self.faults.resolve(&origin);
                }
                Err(e) => {
                    report.failed += 1;
                    self.faults.report(&origin, &e);
                }
            }
        }

        client.close().await;
        tracing::info!(
            "Device {}: polled {} components, {} failed",
            self.config.id,
            report.polled,
            report.failed
        );
        report
    }
}
