//! Opening and classifying Modbus sessions.
//!
//! A device is addressed by a single string: an absolute path is opened as
//! Modbus RTU on a serial line with the family's fixed line parameters,
//! anything else must be a `host:port` pair and is opened as Modbus TCP.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::Context as _;
use tokio_modbus::Slave;

use crate::protocol::{DeviceKind, SLAVE_ID};

/// Represents all possible errors that can occur during Modbus communication.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error originating from the decoding logic, such as a word-count
    /// mismatch or an invalid clock block.
    #[error(transparent)]
    Protocol(#[from] crate::error::Error),

    /// A Modbus exception response from the device (e.g., "Illegal Function").
    #[error(transparent)]
    ModbusException(#[from] tokio_modbus::ExceptionCode),

    /// A transport or communication error from the underlying `tokio-modbus`
    /// client.
    #[error(transparent)]
    Modbus(#[from] tokio_modbus::Error),
}

/// The result type for Modbus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether the error is a response timeout, the only error class worth one
/// more attempt.
pub fn is_timeout(error: &Error) -> bool {
    matches!(
        error,
        Error::Modbus(tokio_modbus::Error::Transport(io))
            if io.kind() == std::io::ErrorKind::TimedOut
    )
}

/// How to reach the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    Serial(String),
    /// TCP endpoint, e.g. `192.168.1.50:502`.
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Interprets a `device_or_uri` argument. A leading `/` means a serial
    /// device path; anything else must resolve as `host:port`.
    pub fn parse(device_or_uri: &str) -> anyhow::Result<Self> {
        if device_or_uri.starts_with('/') {
            return Ok(Endpoint::Serial(device_or_uri.to_string()));
        }

        device_or_uri
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(Endpoint::Tcp)
            .with_context(|| {
                format!("'{device_or_uri}' is neither a serial device path nor a host:port address")
            })
    }
}

/// Creates and configures a `tokio_serial::SerialPortBuilder` for RTU
/// communication. Both supported families use 8 data bits, no parity and one
/// stop bit; only the baud rate varies.
///
/// This only configures the builder; the port is opened by the `tokio-modbus`
/// client constructor.
pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .data_bits(tokio_serial::DataBits::Eight)
        .flow_control(tokio_serial::FlowControl::None)
}

/// Opens a synchronous Modbus session to `endpoint` and applies the
/// response timeout (the family default unless overridden).
pub fn connect(
    endpoint: &Endpoint,
    kind: DeviceKind,
    timeout: Option<Duration>,
) -> anyhow::Result<tokio_modbus::client::sync::Context> {
    let slave = Slave(SLAVE_ID);
    let mut ctx = match endpoint {
        Endpoint::Serial(device) => tokio_modbus::client::sync::rtu::connect_slave(
            &serial_port_builder(device, kind.baud_rate()),
            slave,
        )
        .with_context(|| format!("Cannot open device {device}"))?,
        Endpoint::Tcp(addr) => tokio_modbus::client::sync::tcp::connect_slave(*addr, slave)
            .with_context(|| format!("Cannot connect to {addr}"))?,
    };
    ctx.set_timeout(timeout.unwrap_or(kind.response_timeout()));
    Ok(ctx)
}
