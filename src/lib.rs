//! A telemetry exporter for solar-power hardware reachable over Modbus.
//!
//! The crate polls an EPEVER charge controller or a Growatt storage inverter
//! over Modbus RTU or TCP, keeps the most recent readings in a shared
//! in-memory snapshot and exposes that snapshot through two independent
//! consumers:
//!
//! 1.  **Prometheus**: a scrape endpoint serving the text exposition format
//!     (version 0.0.4). See [`prometheus`].
//! 2.  **Home Assistant**: an MQTT bridge publishing retained discovery
//!     messages and periodic JSON state updates. See [`mqtt`].
//!
//! The three workers (poller, scrape server, MQTT bridge) run on plain
//! threads and coordinate through the [`store::SharedState`] handle created
//! by the binary at startup. The poller owns the Modbus session exclusively;
//! the consumers only ever touch the snapshot.
//!
//! ## Quick start
//!
//! ```no_run
//! use solar_exporter_lib::{poller::Poller, protocol::DeviceKind, store::SharedState};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let state = Arc::new(SharedState::new());
//!
//!     let mut poller = Poller::connect("/dev/ttyUSB0", DeviceKind::Growatt, None, Arc::clone(&state))?;
//!     std::thread::spawn(move || poller.run());
//!
//!     let snapshot = state.metrics.snapshot();
//!     println!("{} readings", snapshot.readings.len());
//!
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod connection;
pub mod error;
pub mod mqtt;
pub mod poller;
pub mod prometheus;
pub mod protocol;
pub mod store;
