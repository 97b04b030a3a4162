//! The Modbus polling engine.
//!
//! One poller owns one Modbus session and refreshes the shared snapshot
//! every [`REFRESH_PERIOD`]. Input registers are read every cycle, holding
//! registers (device settings) hourly, and once a day the device clock is
//! checked against the host clock and rewritten if it drifted too far.
//!
//! A register read that times out is retried exactly once. Any other error,
//! or a second timeout, is final for that register: it is counted as failed
//! and omitted from the cycle, so consumers never see a stale value under a
//! current name. The cycle accumulates into a private buffer and publishes
//! with a single swap at the end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};
use tokio_modbus::prelude::{SyncReader, SyncWriter};

use crate::clock;
use crate::connection::{self, Endpoint};
use crate::protocol::{DeviceKind, RegisterSpec, READ_FAILED_METRIC, READ_SUCCEEDED_METRIC};
use crate::store::{Reading, SharedState};

/// Time between poll cycles.
pub const REFRESH_PERIOD: Duration = Duration::from_secs(10);
/// How often the settings (holding registers) are re-read.
pub const SETTINGS_CADENCE: Duration = Duration::from_secs(60 * 60);
/// How often the device clock is checked against the host clock.
pub const CLOCK_CADENCE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
enum Bank {
    Input,
    Holding,
}

/// Owns the Modbus session for one device and keeps its snapshot fresh.
pub struct Poller {
    ctx: tokio_modbus::client::sync::Context,
    kind: DeviceKind,
    state: Arc<SharedState>,
    // None means due on the next cycle
    last_settings_read_at: Option<Instant>,
    last_clock_sync_at: Option<Instant>,
}

impl Poller {
    /// Opens the Modbus session for `device_or_uri`. A leading `/` selects
    /// RTU with the family's line parameters, otherwise `host:port` selects
    /// TCP. Failure here is fatal to the process.
    pub fn connect(
        device_or_uri: &str,
        kind: DeviceKind,
        timeout: Option<Duration>,
        state: Arc<SharedState>,
    ) -> Result<Self> {
        let endpoint = Endpoint::parse(device_or_uri)?;
        let ctx = connection::connect(&endpoint, kind, timeout)?;
        info!("Connected to {device_or_uri}");
        Ok(Self {
            ctx,
            kind,
            state,
            last_settings_read_at: None,
            last_clock_sync_at: None,
        })
    }

    /// Polls until shutdown is requested, waking at each multiple of
    /// [`REFRESH_PERIOD`] and watching the shutdown flag once a second.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "Polling {} registers every {}",
            self.kind.metric_prefix(),
            humantime::format_duration(REFRESH_PERIOD)
        );

        let mut deadline = Instant::now();
        while self.state.keep_running() {
            match self.cycle() {
                0 => warn!("Cycle finished without a single successful read"),
                succeeded => debug!("Cycle finished with {succeeded} readings"),
            }

            while deadline <= Instant::now() {
                deadline += REFRESH_PERIOD;
            }
            loop {
                if !self.state.keep_running() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep((deadline - now).min(Duration::from_secs(1)));
            }
        }

        info!("Poller stopped");
        Ok(())
    }

    /// One full pass over the catalogs. Returns the number of successful
    /// register reads; zero means the consumers will report "no metrics".
    fn cycle(&mut self) -> u64 {
        let mut readings = Vec::new();
        let mut succeeded = 0;
        let mut failed = 0;

        if due(self.last_clock_sync_at, CLOCK_CADENCE) {
            if let Err(e) = self.sync_clock() {
                // never fatal, the poller keeps going without a clock
                warn!("Clock synchronization failed: {e}");
            }
            self.last_clock_sync_at = Some(Instant::now());
        }

        if due(self.last_settings_read_at, SETTINGS_CADENCE) {
            self.read_bank(Bank::Holding, &mut readings, &mut succeeded, &mut failed);
            self.last_settings_read_at = Some(Instant::now());
        }

        self.read_bank(Bank::Input, &mut readings, &mut succeeded, &mut failed);

        readings.push(Reading {
            name: READ_SUCCEEDED_METRIC,
            value: succeeded as f64,
        });
        readings.push(Reading {
            name: READ_FAILED_METRIC,
            value: failed as f64,
        });

        self.state.metrics.replace(readings, succeeded, failed);
        succeeded
    }

    fn read_bank(
        &mut self,
        bank: Bank,
        readings: &mut Vec<Reading>,
        succeeded: &mut u64,
        failed: &mut u64,
    ) {
        let specs = match bank {
            Bank::Input => self.kind.input_registers(),
            Bank::Holding => self.kind.holding_registers(),
        };

        for spec in specs {
            match self.read_register(bank, spec) {
                Ok(value) => {
                    debug!("{} = {}", spec.human_name, value);
                    readings.push(Reading {
                        name: spec.metric_name,
                        value,
                    });
                    *succeeded += 1;
                }
                Err(e) => {
                    warn!("Reading {} failed: {}", spec.human_name, e);
                    *failed += 1;
                }
            }
        }
    }

    /// Reads and decodes one cataloged register. A double register is
    /// fetched in a single two-word transaction.
    fn read_register(&mut self, bank: Bank, spec: &RegisterSpec) -> connection::Result<f64> {
        let count = spec.width.word_count();
        let words = retry_once_on_timeout(|| {
            let rsp = match bank {
                Bank::Input => self.ctx.read_input_registers(spec.address, count),
                Bank::Holding => self.ctx.read_holding_registers(spec.address, count),
            };
            Ok(rsp??)
        })?;
        Ok(spec.decode(&words)?)
    }

    /// Reads the device clock and rewrites it from the host clock if the
    /// drift exceeds the threshold.
    fn sync_clock(&mut self) -> connection::Result<()> {
        let layout = self.kind.clock();
        let words = retry_once_on_timeout(|| {
            Ok(self
                .ctx
                .read_holding_registers(layout.address(), layout.word_count())??)
        })?;

        let device_time = layout.decode(&words)?;
        let host_local = clock::host_local_now();
        let skew = device_time.signed_duration_since(host_local).num_seconds();

        match clock::correction(layout, device_time, host_local) {
            Some(correction) => {
                warn!("Device clock is off by {skew}s, resetting to host time");
                self.ctx
                    .write_multiple_registers(layout.address(), &correction)??;
            }
            None => debug!("Device clock is off by {skew}s, within tolerance"),
        }
        Ok(())
    }
}

fn due(last: Option<Instant>, cadence: Duration) -> bool {
    match last {
        None => true,
        Some(last) => last.elapsed() >= cadence,
    }
}

/// Runs `op`, repeating it once more if the first attempt failed with a
/// response timeout. Any other error, or a second timeout, is final.
fn retry_once_on_timeout<T>(
    mut op: impl FnMut() -> connection::Result<T>,
) -> connection::Result<T> {
    match op() {
        Err(e) if connection::is_timeout(&e) => {
            debug!("Response timed out, retrying once");
            op()
        }
        result => result,
    }
}
