//! E3DC holding register map and the raw reads for each component type.
//!
//! All 32-bit values are sent low word first.

use crate::error::Result;
use crate::modbus_client::{read_int16_block, read_register, RegisterClient};
use crate::register::{RegisterAddress, WordOrder};

/// Battery power, positive while charging
pub const BAT_POWER: RegisterAddress = RegisterAddress::int32(40069, WordOrder::Little);
/// Battery state of charge in percent
pub const BAT_SOC: RegisterAddress = RegisterAddress::int16(40082);
/// PV power of the inverter built into the E3DC
pub const PV_POWER: RegisterAddress = RegisterAddress::int32(40067, WordOrder::Little);
/// PV power of an additional inverter feeding the E3DC
pub const PV_EXTERNAL_POWER: RegisterAddress = RegisterAddress::int32(40075, WordOrder::Little);
/// Grid power, negative while feeding in
pub const GRID_POWER: RegisterAddress = RegisterAddress::int32(40073, WordOrder::Little);

/// Seven power meter blocks of `{type, L1, L2, L3}`
pub const METER_BLOCKS_START: u16 = 40104;
pub const METER_BLOCK_COUNT: u16 = 7;
const METER_BLOCK_LEN: usize = 4;
const METER_TYPE_GRID: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatSample {
    pub power: i64,
    pub soc: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InverterSample {
    /// Negative while producing
    pub pv: i64,
    pub pv_external: i64,
}

impl InverterSample {
    pub fn total(&self) -> i64 {
        self.pv + self.pv_external
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSample {
    pub power: i64,
    pub powers: [i64; 3],
}

pub async fn read_bat(client: &mut dyn RegisterClient, unit: u8) -> Result<BatSample> {
    let soc = read_register(client, unit, BAT_SOC).await?;
    let power = read_register(client, unit, BAT_POWER).await?;
    Ok(BatSample { power, soc })
}

/// The external PV register is only read with `read_ext`, otherwise an
/// independently polled inverter would be counted twice.
pub async fn read_inverter(
    client: &mut dyn RegisterClient,
    unit: u8,
    read_ext: bool,
) -> Result<InverterSample> {
    let pv = -read_register(client, unit, PV_POWER).await?;
    let pv_external = if read_ext {
        read_register(client, unit, PV_EXTERNAL_POWER).await?
    } else {
        0
    };
    Ok(InverterSample { pv, pv_external })
}

pub async fn read_counter(client: &mut dyn RegisterClient, unit: u8) -> Result<CounterSample> {
    let power = read_register(client, unit, GRID_POWER).await?;
    let blocks = read_int16_block(
        client,
        unit,
        METER_BLOCKS_START,
        METER_BLOCK_COUNT * METER_BLOCK_LEN as u16,
    )
    .await?;
    let powers = grid_phase_powers(&blocks).unwrap_or_else(|| {
        tracing::debug!("No grid meter block found, phase powers unknown");
        [0; 3]
    });
    Ok(CounterSample { power, powers })
}

fn grid_phase_powers(blocks: &[i64]) -> Option<[i64; 3]> {
    blocks
        .chunks_exact(METER_BLOCK_LEN)
        .find(|block| block[0] == METER_TYPE_GRID)
        .map(|block| [block[1], block[2], block[3]])
}
