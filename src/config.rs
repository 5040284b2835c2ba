use std::env;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tokio::time::{self, Interval, MissedTickBehavior};

use crate::error::{PollError, Result};

const DEFAULT_PORT: u16 = 502;
const DEFAULT_UNIT_ID: u8 = 1;
const DEFAULT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_SAMPLE_GAP_S: u64 = 300;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
const DEFAULT_STATE_DIR: &str = "state";
const DEFAULT_COMPONENTS: &str = "bat:1,inverter:2,counter:3";

/// Connection and behaviour settings of one E3DC device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: u32,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Also read the externally connected PV register
    #[serde(default)]
    pub read_ext: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_sample_gap_s")]
    pub max_sample_gap_s: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_sample_gap_s() -> u64 {
    DEFAULT_MAX_SAMPLE_GAP_S
}

impl DeviceConfig {
    pub fn new(id: u32, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            port: DEFAULT_PORT,
            unit_id: DEFAULT_UNIT_ID,
            read_ext: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_sample_gap_s: DEFAULT_MAX_SAMPLE_GAP_S,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_sample_gap(&self) -> Duration {
        Duration::from_secs(self.max_sample_gap_s)
    }

    /// Resolves `address:port`, accepting host names
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| PollError::Configuration(format!("address {}: {e}", self.address)))?
            .next()
            .ok_or_else(|| {
                PollError::Configuration(format!("address {} did not resolve", self.address))
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(PollError::Configuration("device address is empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(PollError::Configuration("timeout must be positive".to_string()));
        }
        if self.max_sample_gap_s == 0 {
            return Err(PollError::Configuration(
                "max sample gap must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One component of a device, tagged by its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ComponentConfig {
    Bat {
        id: u32,
        #[serde(default)]
        name: Option<String>,
    },
    Counter {
        id: u32,
        #[serde(default)]
        name: Option<String>,
    },
    Inverter {
        id: u32,
        #[serde(default)]
        name: Option<String>,
    },
}

impl ComponentConfig {
    pub fn id(&self) -> u32 {
        match self {
            Self::Bat { id, .. } | Self::Counter { id, .. } | Self::Inverter { id, .. } => *id,
        }
    }

    pub fn name(&self) -> String {
        let (name, fallback) = match self {
            Self::Bat { name, .. } => (name, "E3DC Battery"),
            Self::Counter { name, .. } => (name, "E3DC Counter"),
            Self::Inverter { name, .. } => (name, "E3DC Inverter"),
        };
        name.clone().unwrap_or_else(|| fallback.to_string())
    }

    /// Parses `kind:id`, e.g. `bat:1`
    pub fn parse(entry: &str) -> Result<Self> {
        let invalid = || PollError::Configuration(format!("invalid component `{entry}`"));
        let (kind, id) = entry.trim().split_once(':').ok_or_else(invalid)?;
        let id: u32 = id.trim().parse().map_err(|_| invalid())?;
        match kind.trim().to_ascii_lowercase().as_str() {
            "bat" => Ok(Self::Bat { id, name: None }),
            "counter" => Ok(Self::Counter { id, name: None }),
            "inverter" => Ok(Self::Inverter { id, name: None }),
            _ => Err(invalid()),
        }
    }
}

/// Everything the polling daemon needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    pub device: DeviceConfig,
    pub components: Vec<ComponentConfig>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl PollerConfig {
    /// Reads `E3DC_CONFIG` (a JSON file) when set, otherwise the individual `E3DC_*` variables
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = env::var("E3DC_CONFIG") {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| PollError::Configuration(format!("reading {path}: {e}")))?;
            return Self::from_json(&contents);
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| PollError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let address = lookup("E3DC_ADDRESS").ok_or_else(|| {
            PollError::Configuration("E3DC_ADDRESS is required".to_string())
        })?;
        let mut device = DeviceConfig::new(parse_or("E3DC_DEVICE_ID", &lookup, 0)?, address);
        device.port = parse_or("E3DC_PORT", &lookup, DEFAULT_PORT)?;
        device.unit_id = parse_or("E3DC_UNIT_ID", &lookup, DEFAULT_UNIT_ID)?;
        device.read_ext = parse_bool_safe(lookup("E3DC_READ_EXT"));
        device.timeout_ms = parse_or("E3DC_TIMEOUT_MS", &lookup, DEFAULT_TIMEOUT_MS)?;
        device.max_sample_gap_s =
            parse_or("E3DC_MAX_SAMPLE_GAP_S", &lookup, DEFAULT_MAX_SAMPLE_GAP_S)?;

        let components = lookup("E3DC_COMPONENTS")
            .unwrap_or_else(|| DEFAULT_COMPONENTS.to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(ComponentConfig::parse)
            .collect::<Result<Vec<_>>>()?;

        let config = Self {
            device,
            components,
            state_dir: lookup("E3DC_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_state_dir),
            poll_interval_ms: parse_or("E3DC_POLL_INTERVAL_MS", &lookup, DEFAULT_POLL_INTERVAL_MS)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Cycle timer. A cycle that overruns pushes the next tick back instead
    /// of firing the missed ones in a burst.
    pub fn poll_timer(&self) -> Interval {
        let mut interval = time::interval(self.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        if self.components.is_empty() {
            return Err(PollError::Configuration("no components configured".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(PollError::Configuration(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PollError::Configuration(format!("{name}: invalid value `{raw}`"))),
        None => Ok(default),
    }
}

/// Safely parses a boolean from an optional string, defaulting to false.
/// `1` is accepted as true for compatibility with numeric flags.
pub fn parse_bool_safe(val: Option<String>) -> bool {
    let val = val.unwrap_or_default().trim().to_ascii_lowercase();
    val == "1" || val.parse().unwrap_or_default()
}
