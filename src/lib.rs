//! E3DC Poller Library
//!
//! Polls the battery, inverter and grid meter of an E3DC storage system over one
//! shared Modbus TCP connection, derives restart-safe imported/exported energy
//! totals from the power readings and publishes the results to a value store.

pub mod component;
pub mod config;
pub mod counter_store;
pub mod device;
pub mod error;
pub mod fault;
pub mod legacy;
pub mod modbus_client;
pub mod register;
pub mod sample_reader;
pub mod sim_counter;
pub mod value_store;

// Re-export commonly used types for easier access
pub use component::Component;
pub use config::{ComponentConfig, DeviceConfig, PollerConfig};
pub use counter_store::{CounterKey, CounterStore, CumulativeCounterState, JsonFileStore};
pub use device::{CycleReport, DeviceSession};
pub use error::PollError;
pub use fault::{FaultReporter, FaultStore};
pub use modbus_client::{Connector, RegisterClient, TcpConnector};
pub use sim_counter::CumulativeCounter;
pub use value_store::{ComponentState, ValueSink, ValueStore};
