//! Single-shot reads kept for the positional command line interface.
//!
//! The battery variant may poll two E3DC units at once. Their battery and PV
//! powers are summed while the state of charge is averaged over the units.

use std::sync::Arc;

use crate::config::{ComponentConfig, DeviceConfig};
use crate::counter_store::{CounterKey, CounterStore};
use crate::device::{CycleReport, DeviceSession};
use crate::error::{PollError, Result};
use crate::fault::FaultReporter;
use crate::modbus_client::{Connector, RegisterClient};
use crate::sample_reader::{read_bat, read_inverter, BatSample, InverterSample};
use crate::sim_counter::{CumulativeCounter, Orientation};
use crate::value_store::{BatState, ComponentState, InverterState, ValueSink};

/// Component id the legacy battery and PV values are published under
pub const LEGACY_COMPONENT_ID: u32 = 1;

/// Counter prefixes of the legacy path, apart from the daemon's components
pub const LEGACY_BAT_PREFIX: &str = "speicher";
pub const LEGACY_PV_PREFIX: &str = "pvwatt";

/// Aggregated values of one legacy battery read
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegacyBatReading {
    /// Mean over all units
    pub soc: f64,
    /// Sum over all units
    pub power: i64,
    pub pv: i64,
    pub pv_external: i64,
    /// `pv + pv_external`, plus the other inverter's power when given
    pub pv_total: f64,
}

pub struct LegacyBat {
    unit: u8,
    read_ext: bool,
    bat_counter: CumulativeCounter,
    pv_counter: CumulativeCounter,
    sink: Arc<dyn ValueSink>,
}

impl LegacyBat {
    pub fn new(
        device: &DeviceConfig,
        store: Arc<dyn CounterStore>,
        sink: Arc<dyn ValueSink>,
    ) -> Self {
        let counter = |prefix: &str| {
            CumulativeCounter::new(
                CounterKey::new(device.id, LEGACY_COMPONENT_ID, prefix),
                store.clone(),
            )
            .with_orientation(Orientation::PositiveIsImport)
            .with_max_sample_gap(device.max_sample_gap())
        };
        Self {
            unit: device.unit_id,
            read_ext: device.read_ext,
            bat_counter: counter(LEGACY_BAT_PREFIX),
            pv_counter: counter(LEGACY_PV_PREFIX),
            sink,
        }
    }

    /// Reads every unit, aggregates and publishes a battery and an inverter state.
    /// Any failure aborts the whole read.
    pub async fn update(
        &mut self,
        units: &[Box<dyn Connector>],
        pv_other_power: Option<f64>,
    ) -> Result<LegacyBatReading> {
        if units.is_empty() {
            return Err(PollError::Configuration(
                "legacy battery read needs at least one address".to_string(),
            ));
        }

        let mut soc = 0;
        let mut power = 0;
        let mut pv = 0;
        let mut pv_external = 0;
        for unit in units {
            tracing::debug!(
                "Reading {}, read_external {} pv_other {}",
                unit.describe(),
                self.read_ext,
                pv_other_power.is_some()
            );
            let mut client = unit.connect().await?;
            let read = self.read_unit(client.as_mut()).await;
            client.close().await;
            let (bat, inverter) = read?;
            soc += bat.soc;
            power += bat.power;
            pv += inverter.pv;
            pv_external += inverter.pv_external;
        }

        // Sums for power but a mean for the state of charge
        let reading = LegacyBatReading {
            soc: soc as f64 / units.len() as f64,
            power,
            pv,
            pv_external,
            pv_total: (pv + pv_external) as f64 + pv_other_power.unwrap_or_default(),
        };
        tracing::debug!("Legacy battery reading {reading:?}");

        let (imported, exported) = self.bat_counter.update(reading.power as f64).await?;
        self.sink.set(
            LEGACY_COMPONENT_ID,
            ComponentState::Bat(BatState {
                power: reading.power as f64,
                soc: reading.soc,
                imported,
                exported,
            }),
        );
        let (_, exported_pv) = self.pv_counter.update(reading.pv_total).await?;
        self.sink.set(
            LEGACY_COMPONENT_ID,
            ComponentState::Inverter(InverterState {
                power: reading.pv_total,
                exported: exported_pv,
            }),
        );
        Ok(reading)
    }

    async fn read_unit(
        &self,
        client: &mut dyn RegisterClient,
    ) -> Result<(BatSample, InverterSample)> {
        let bat = read_bat(client, self.unit).await?;
        let inverter = read_inverter(client, self.unit, self.read_ext).await?;
        Ok((bat, inverter))
    }
}

/// Polls a device holding a single counter component once
pub async fn read_legacy_counter(
    device: DeviceConfig,
    connector: Box<dyn Connector>,
    store: Arc<dyn CounterStore>,
    sink: Arc<dyn ValueSink>,
    faults: Arc<dyn FaultReporter>,
) -> Result<CycleReport> {
    let component = ComponentConfig::Counter {
        id: device.id,
        name: None,
    };
    let mut session = DeviceSession::new(device, connector, faults);
    session.add_component(&component, store, sink)?;
    Ok(session.poll_cycle().await)
}
