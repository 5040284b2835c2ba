use std::sync::Arc;

use crate::config::{ComponentConfig, DeviceConfig};
use crate::counter_store::{CounterKey, CounterStore};
use crate::error::Result;
use crate::fault::ComponentInfo;
use crate::modbus_client::RegisterClient;
use crate::sample_reader::{read_bat, read_counter, read_inverter};
use crate::sim_counter::{CumulativeCounter, Orientation};
use crate::value_store::{
    BatState, ComponentKind, ComponentState, CounterState, InverterState, ValueSink,
};

pub const BAT_PREFIX: &str = "battery";
pub const PV_PREFIX: &str = "pv";
pub const GRID_PREFIX: &str = "grid";

/// A polling unit sharing its device's connection
pub enum Component {
    Bat(BatComponent),
    Counter(CounterComponent),
    Inverter(InverterComponent),
}

impl Component {
    /// Builds the component matching the configured type
    pub fn from_config(
        device: &DeviceConfig,
        config: &ComponentConfig,
        store: Arc<dyn CounterStore>,
        sink: Arc<dyn ValueSink>,
    ) -> Self {
        let (kind, prefix) = match config {
            ComponentConfig::Bat { .. } => (ComponentKind::Bat, BAT_PREFIX),
            ComponentConfig::Counter { .. } => (ComponentKind::Counter, GRID_PREFIX),
            ComponentConfig::Inverter { .. } => (ComponentKind::Inverter, PV_PREFIX),
        };
        let info = ComponentInfo {
            device_id: device.id,
            component_id: config.id(),
            kind,
            name: config.name(),
        };
        // Every E3DC role reports charging, consumption and grid draw as positive
        let counter = CumulativeCounter::new(CounterKey::new(device.id, config.id(), prefix), store)
            .with_orientation(Orientation::PositiveIsImport)
            .with_max_sample_gap(device.max_sample_gap());
        let binding = Binding {
            info,
            unit: device.unit_id,
            counter,
            sink,
        };
        match kind {
            ComponentKind::Bat => Self::Bat(BatComponent(binding)),
            ComponentKind::Counter => Self::Counter(CounterComponent(binding)),
            ComponentKind::Inverter => Self::Inverter(InverterComponent {
                binding,
                read_ext: device.read_ext,
            }),
        }
    }

    pub fn info(&self) -> &ComponentInfo {
        match self {
            Self::Bat(c) => &c.0.info,
            Self::Counter(c) => &c.0.info,
            Self::Inverter(c) => &c.binding.info,
        }
    }

    /// Reads the component, advances its counter and publishes the result
    pub async fn update(&mut self, client: &mut dyn RegisterClient) -> Result<()> {
        match self {
            Self::Bat(c) => c.update(client).await,
            Self::Counter(c) => c.update(client).await,
            Self::Inverter(c) => c.update(client).await,
        }
    }
}

/// What every component owns besides its reader
struct Binding {
    info: ComponentInfo,
    unit: u8,
    counter: CumulativeCounter,
    sink: Arc<dyn ValueSink>,
}

impl Binding {
    fn publish(&self, state: ComponentState) {
        self.sink.set(self.info.component_id, state);
    }
}

pub struct BatComponent(Binding);

impl BatComponent {
    async fn update(&mut self, client: &mut dyn RegisterClient) -> Result<()> {
        let binding = &mut self.0;
        let sample = read_bat(client, binding.unit).await?;
        tracing::debug!(
            "{}: soc {} power {}",
            binding.info.name,
            sample.soc,
            sample.power
        );
        let (imported, exported) = binding.counter.update(sample.power as f64).await?;
        binding.publish(ComponentState::Bat(BatState {
            power: sample.power as f64,
            soc: sample.soc as f64,
            imported,
            exported,
        }));
        Ok(())
    }
}

pub struct CounterComponent(Binding);

impl CounterComponent {
    async fn update(&mut self, client: &mut dyn RegisterClient) -> Result<()> {
        let binding = &mut self.0;
        let sample = read_counter(client, binding.unit).await?;
        tracing::debug!(
            "{}: power {} phases {:?}",
            binding.info.name,
            sample.power,
            sample.powers
        );
        let (imported, exported) = binding.counter.update(sample.power as f64).await?;
        binding.publish(ComponentState::Counter(CounterState {
            power: sample.power as f64,
            powers: sample.powers.map(|p| p as f64),
            imported,
            exported,
        }));
        Ok(())
    }
}

pub struct InverterComponent {
    binding: Binding,
    read_ext: bool,
}

impl InverterComponent {
    async fn update(&mut self, client: &mut dyn RegisterClient) -> Result<()> {
        let binding = &mut self.binding;
        let sample = read_inverter(client, binding.unit, self.read_ext).await?;
        let power = sample.total();
        tracing::debug!(
            "{}: pv {} pv_external {} total {power}",
            binding.info.name,
            sample.pv,
            sample.pv_external
        );
        let (_, exported) = binding.counter.update(power as f64).await?;
        binding.publish(ComponentState::Inverter(InverterState {
            power: power as f64,
            exported,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter_store::{CumulativeCounterState, MemoryCounterStore};
    use crate::error::PollError;
    use crate::modbus_client::testing::FakeDevice;
    use crate::value_store::ValueStore;

    fn build(
        device: &DeviceConfig,
        config: ComponentConfig,
    ) -> (Component, Arc<MemoryCounterStore>, ValueStore) {
        let store = Arc::new(MemoryCounterStore::new());
        let values = ValueStore::new();
        let component =
            Component::from_config(device, &config, store.clone(), Arc::new(values.clone()));
        (component, store, values)
    }

    #[tokio::test]
    async fn test_bat_publishes_state() {
        let device = FakeDevice::default();
        device.set(40082, 64);
        device.set_i32_little(40069, 2300);
        let (mut component, store, values) =
            build(&DeviceConfig::new(3, "e3dc"), ComponentConfig::Bat { id: 1, name: None });

        let mut client = device.open().await;
        component.update(client.as_mut()).await.unwrap();

        assert_eq!(
            values.get(ComponentKind::Bat, 1),
            Some(ComponentState::Bat(BatState {
                power: 2300.0,
                soc: 64.0,
                imported: 0.0,
                exported: 0.0,
            }))
        );
        let key = CounterKey::new(3, 1, BAT_PREFIX);
        assert_eq!(store.get(&key).unwrap().power, 2300.0);
    }

    #[tokio::test]
    async fn test_bat_continues_persisted_totals() {
        let device = FakeDevice::default();
        device.set_i32_little(40069, -1000);
        let (mut component, store, values) =
            build(&DeviceConfig::new(3, "e3dc"), ComponentConfig::Bat { id: 1, name: None });
        store.insert(
            CounterKey::new(3, 1, BAT_PREFIX),
            CumulativeCounterState {
                imported: 10.0,
                exported: 20.0,
                timestamp: 0.0,
                power: 0.0,
            },
        );

        let mut client = device.open().await;
        component.update(client.as_mut()).await.unwrap();
        // The persisted timestamp is far in the past so the sample only rebases
        match values.get(ComponentKind::Bat, 1) {
            Some(ComponentState::Bat(state)) => {
                assert_eq!((state.imported, state.exported), (10.0, 20.0));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inverter_reports_production_as_negative() {
        let device = FakeDevice::default();
        device.set_i32_little(40067, 5000);
        device.set_i32_little(40075, -700);
        let mut config = DeviceConfig::new(1, "e3dc");
        config.read_ext = true;
        let (mut component, _, values) =
            build(&config, ComponentConfig::Inverter { id: 2, name: None });

        let mut client = device.open().await;
        component.update(client.as_mut()).await.unwrap();
        assert_eq!(
            values.get(ComponentKind::Inverter, 2),
            Some(ComponentState::Inverter(InverterState {
                power: -5700.0,
                exported: 0.0,
            }))
        );
    }

    #[tokio::test]
    async fn test_counter_publishes_phase_powers() {
        let device = FakeDevice::default();
        device.set_i32_little(40073, 900);
        device.set(40104, 1);
        device.set(40105, 300);
        device.set(40106, 300);
        device.set(40107, 300);
        let (mut component, _, values) = build(
            &DeviceConfig::new(1, "e3dc"),
            ComponentConfig::Counter { id: 5, name: None },
        );

        let mut client = device.open().await;
        component.update(client.as_mut()).await.unwrap();
        match values.get(ComponentKind::Counter, 5) {
            Some(ComponentState::Counter(state)) => {
                assert_eq!(state.power, 900.0);
                assert_eq!(state.powers, [300.0, 300.0, 300.0]);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_error_publishes_nothing() {
        let device = FakeDevice::default();
        device.fail_at(40069, |_| PollError::Protocol("bad frame".to_string()));
        let (mut component, store, values) =
            build(&DeviceConfig::new(1, "e3dc"), ComponentConfig::Bat { id: 1, name: None });

        let mut client = device.open().await;
        let result = component.update(client.as_mut()).await;
        assert!(matches!(result, Err(PollError::Protocol(_))));
        assert!(values.snapshot().is_empty());
        assert!(store.get(&CounterKey::new(1, 1, BAT_PREFIX)).is_none());
    }

    #[test]
    fn test_info_from_config() {
        let (component, _, _) = build(
            &DeviceConfig::new(9, "e3dc"),
            ComponentConfig::Inverter {
                id: 4,
                name: Some("Dach".to_string()),
            },
        );
        assert_eq!(
            component.info(),
            &ComponentInfo {
                device_id: 9,
                component_id: 4,
                kind: ComponentKind::Inverter,
                name: "Dach".to_string(),
            }
        );
    }
}
