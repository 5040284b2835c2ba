use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_modbus::prelude::*;

use crate::error::{PollError, Result};
use crate::register::RegisterAddress;

/// An open request/response connection to a device
#[async_trait]
pub trait RegisterClient: Send {
    /// Reads `count` consecutive holding registers starting at `address`
    async fn read_holding_registers(&mut self, unit: u8, address: u16, count: u16)
        -> Result<Vec<u16>>;

    /// Releases the connection. Errors while closing are not reported.
    async fn close(&mut self);
}

/// Opens connections to one device
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RegisterClient>>;

    /// Human readable target, used in log lines
    fn describe(&self) -> String;
}

/// Reads and decodes a single value
pub async fn read_register(
    client: &mut dyn RegisterClient,
    unit: u8,
    register: RegisterAddress,
) -> Result<i64> {
    let words = client
        .read_holding_registers(unit, register.address, register.data_type.word_count())
        .await?;
    register.decode(&words)
}

/// Reads `count` consecutive INT16 registers
pub async fn read_int16_block(
    client: &mut dyn RegisterClient,
    unit: u8,
    address: u16,
    count: u16,
) -> Result<Vec<i64>> {
    let words = client.read_holding_registers(unit, address, count).await?;
    if words.len() != count as usize {
        return Err(PollError::Protocol(format!(
            "register block {address} returned {} words, expected {count}",
            words.len()
        )));
    }
    Ok(words.into_iter().map(|w| w as i16 as i64).collect())
}

/// Modbus TCP connector
pub struct TcpConnector {
    target_address: SocketAddr,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(target_address: SocketAddr, timeout: Duration) -> Self {
        Self {
            target_address,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn RegisterClient>> {
        tracing::debug!("Connecting to {}", self.target_address);
        let ctx = timeout(self.timeout, tcp::connect(self.target_address))
            .await?
            .map_err(|e| {
                PollError::Connection(format!("connect to {} failed: {e}", self.target_address))
            })?;
        Ok(Box::new(TcpRegisterClient {
            ctx,
            timeout: self.timeout,
        }))
    }

    fn describe(&self) -> String {
        self.target_address.to_string()
    }
}

/// Connection returned by [`TcpConnector`]
pub struct TcpRegisterClient {
    ctx: client::Context,
    timeout: Duration,
}

#[async_trait]
impl RegisterClient for TcpRegisterClient {
    async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.ctx.set_slave(Slave(unit));
        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        match timeout(self.timeout, self.ctx.read_holding_registers(address, count)).await? {
            Ok(Ok(words)) => Ok(words),
            Ok(Err(exception)) => Err(PollError::Protocol(format!(
                "Modbus exception reading {address}/{count}: {exception:?}"
            ))),
            Err(io_error) => Err(PollError::Connection(format!(
                "IO error reading {address}/{count}: {io_error}"
            ))),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ctx.disconnect().await {
            tracing::debug!("Ignoring error while disconnecting: {e}");
        }
    }
}
