//! Register catalogs and decoding rules for the supported device families.
//!
//! Growatt addresses follow the "Growatt Inverter Modbus RTU Protocol"
//! document for the SPF storage machines; EPEVER addresses follow the
//! "B-Series MODBUS Specification". Both families answer on slave id 1 and
//! speak 8N1 on the serial line, they only differ in baud rate and response
//! latency.

use crate::clock::ClockLayout;
use crate::error::Error;
use std::time::Duration;

/// 16-bit value stored in a Modbus register.
pub type Word = u16;

/// Modbus slave id used by both families (required in RTU mode).
pub const SLAVE_ID: u8 = 1;

/// Synthetic per-cycle counter appended after the register readings.
pub const READ_SUCCEEDED_METRIC: &str = "read_metric_succeeded_total";
/// Synthetic per-cycle counter appended after the register readings.
pub const READ_FAILED_METRIC: &str = "read_metric_failed_total";

/// Width of a register in 16-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    /// One word.
    Single,
    /// Two words, transferred high word first in a single transaction.
    Double,
}

impl RegisterWidth {
    /// The quantity passed to the Modbus read request.
    pub const fn word_count(self) -> u16 {
        match self {
            RegisterWidth::Single => 1,
            RegisterWidth::Double => 2,
        }
    }
}

/// One entry of a register catalog.
///
/// `device_class`, `unit` and `state_class` are Home Assistant annotations
/// consumed only by the MQTT bridge; an empty string means the field is left
/// out of the discovery payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterSpec {
    pub address: u16,
    pub human_name: &'static str,
    pub metric_name: &'static str,
    pub width: RegisterWidth,
    pub scale: f64,
    pub device_class: &'static str,
    pub unit: &'static str,
    pub state_class: &'static str,
}

impl RegisterSpec {
    /// Decodes the words of one response into the reported value.
    ///
    /// A single register yields `w0 * scale`. A double register yields
    /// `((w0 << 16) + w1) * scale` with the high word first. The scale may
    /// be negative for registers whose raw integer carries an inverted sign.
    pub fn decode(&self, words: &[Word]) -> Result<f64, Error> {
        let expected = self.width.word_count() as usize;
        if words.len() != expected {
            return Err(Error::WordCount {
                expected,
                got: words.len(),
            });
        }

        let raw = match self.width {
            RegisterWidth::Single => words[0] as u64,
            RegisterWidth::Double => ((words[0] as u64) << 16) + words[1] as u64,
        };
        Ok(raw as f64 * self.scale)
    }
}

const fn reg(
    address: u16,
    human_name: &'static str,
    metric_name: &'static str,
    width: RegisterWidth,
    scale: f64,
    device_class: &'static str,
    unit: &'static str,
    state_class: &'static str,
) -> RegisterSpec {
    RegisterSpec {
        address,
        human_name,
        metric_name,
        width,
        scale,
        device_class,
        unit,
        state_class,
    }
}

use RegisterWidth::{Double, Single};

/// Live telemetry of the Growatt storage inverters, read every cycle.
pub const GROWATT_INPUT_REGISTERS: &[RegisterSpec] = &[
    reg(0, "system status", "system_status", Single, 1.0, "", "", ""),
    reg(1, "PV1 voltage", "pv1_volts", Single, 0.1, "voltage", "V", ""),
    reg(3, "PV1 charge power", "pv1_watts", Double, 0.1, "power", "W", ""),
    reg(17, "battery voltage", "battery_volts", Single, 0.01, "voltage", "V", ""),
    reg(18, "battery SOC", "battery_soc", Single, 1.0, "battery", "%", ""),
    reg(20, "grid voltage", "grid_volts", Single, 0.1, "voltage", "V", ""),
    reg(21, "grid frequency", "grid_hertz", Single, 0.01, "frequency", "Hz", ""),
    reg(25, "inverter temperature", "temperature_inverter_celsius", Single, 0.1, "temperature", "°C", ""),
    reg(26, "DC-DC temperature", "temperature_dcdc_celsius", Single, 0.1, "temperature", "°C", ""),
    reg(32, "Buck1 temperature", "temperature_buck1_celsius", Single, 0.1, "temperature", "°C", ""),
    reg(33, "Buck2 temperature", "temperature_buck2_celsius", Single, 0.1, "temperature", "°C", ""),
    reg(40, "fault bits", "fault_bits", Single, 1.0, "", "", ""),
    reg(41, "warning bits", "warning_bits", Single, 1.0, "", "", ""),
    reg(48, "PV production today", "energy_pv_today_kwh", Double, 0.1, "energy", "kWh", ""),
    reg(50, "PV production total", "energy_pv_total_kwh", Double, 0.1, "energy", "kWh", "total_increasing"),
    // raw value is sign-inverted: positive while discharging
    reg(77, "battery power", "battery_watts", Double, -0.1, "power", "W", ""),
    reg(81, "MPPT fan speed", "fan_speed_mppt", Single, 1.0, "", "%", ""),
    reg(82, "inverter fan speed", "fan_speed_inverter", Single, 1.0, "", "%", ""),
];

/// Charging settings of the Growatt storage inverters, re-read hourly.
pub const GROWATT_HOLDING_REGISTERS: &[RegisterSpec] = &[
    reg(34, "max charging current", "settings_max_charging_amps", Single, 1.0, "current", "A", ""),
    reg(35, "bulk charging voltage", "settings_bulk_charging_volts", Single, 0.1, "voltage", "V", ""),
    reg(36, "float charging voltage", "settings_float_charging_volts", Single, 0.1, "voltage", "V", ""),
    reg(37, "switch to utility voltage", "settings_switch_to_utility_volts", Single, 0.1, "voltage", "V", ""),
];

/// Live telemetry of the EPEVER charge controllers, read every cycle.
pub const EPEVER_INPUT_REGISTERS: &[RegisterSpec] = &[
    reg(0x3100, "PV voltage", "pv_volts", Single, 0.01, "voltage", "V", ""),
    reg(0x3101, "PV current", "pv_amperes", Single, 0.01, "current", "A", ""),
    reg(0x3102, "PV power", "pv_watts", Double, 0.01, "power", "W", ""),
    reg(0x3104, "battery voltage", "battery_volts", Single, 0.01, "voltage", "V", ""),
    reg(0x3105, "battery current", "battery_amperes", Single, 0.01, "current", "A", ""),
    reg(0x3106, "battery power", "battery_watts", Double, 0.01, "power", "W", ""),
    reg(0x3110, "battery temperature", "battery_temperature_celsius", Single, 0.01, "temperature", "°C", ""),
    reg(0x311A, "battery SOC", "battery_soc", Single, 1.0, "battery", "%", ""),
    reg(0x3200, "battery status", "battery_status", Single, 1.0, "", "", ""),
    reg(0x3201, "charging status", "charging_status", Single, 1.0, "", "", ""),
    reg(0x3302, "max battery voltage today", "battery_volts_max_today", Single, 0.01, "voltage", "V", ""),
    reg(0x3303, "min battery voltage today", "battery_volts_min_today", Single, 0.01, "voltage", "V", ""),
    reg(0x330C, "generated energy today", "generated_energy_today_watthours", Double, 10.0, "energy", "Wh", ""),
    reg(0x3312, "generated energy total", "generated_energy_total_watthours", Double, 10.0, "energy", "Wh", "total_increasing"),
];

/// Charging settings of the EPEVER charge controllers, re-read hourly.
pub const EPEVER_HOLDING_REGISTERS: &[RegisterSpec] = &[
    reg(0x9007, "boost charging voltage", "settings_boost_charging_volts", Single, 0.01, "voltage", "V", ""),
    reg(0x9008, "float charging voltage", "settings_float_charging_volts", Single, 0.01, "voltage", "V", ""),
    reg(0x9009, "boost reconnect voltage", "settings_boost_reconnect_volts", Single, 0.01, "voltage", "V", ""),
];

/// The supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Growatt SPF storage inverter.
    Growatt,
    /// EPEVER charge controller.
    Epever,
}

impl DeviceKind {
    /// Registers polled every cycle.
    pub const fn input_registers(self) -> &'static [RegisterSpec] {
        match self {
            DeviceKind::Growatt => GROWATT_INPUT_REGISTERS,
            DeviceKind::Epever => EPEVER_INPUT_REGISTERS,
        }
    }

    /// Settings registers polled on the hourly cadence.
    pub const fn holding_registers(self) -> &'static [RegisterSpec] {
        match self {
            DeviceKind::Growatt => GROWATT_HOLDING_REGISTERS,
            DeviceKind::Epever => EPEVER_HOLDING_REGISTERS,
        }
    }

    /// Layout of the real-time clock block in the holding register bank.
    pub const fn clock(self) -> ClockLayout {
        match self {
            DeviceKind::Growatt => ClockLayout::SixWord { address: 45 },
            DeviceKind::Epever => ClockLayout::Packed { address: 0x9013 },
        }
    }

    /// Serial line speed; both families run 8N1.
    pub const fn baud_rate(self) -> u32 {
        match self {
            DeviceKind::Growatt => 9_600,
            DeviceKind::Epever => 115_200,
        }
    }

    /// Default Modbus response timeout. The Growatt answers quickly over a
    /// direct line, the EPEVER behind its RS485 adapter needs much longer.
    pub const fn response_timeout(self) -> Duration {
        match self {
            DeviceKind::Growatt => Duration::from_millis(200),
            DeviceKind::Epever => Duration::from_secs(1),
        }
    }

    /// Prefix of the scrape metric ids and the MQTT unique ids.
    pub const fn metric_prefix(self) -> &'static str {
        match self {
            DeviceKind::Growatt => "growatt",
            DeviceKind::Epever => "epever",
        }
    }

    /// Manufacturer name shown by Home Assistant.
    pub const fn display_name(self) -> &'static str {
        match self {
            DeviceKind::Growatt => "Growatt",
            DeviceKind::Epever => "EPEVER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(width: RegisterWidth, scale: f64) -> RegisterSpec {
        reg(0, "test", "test", width, scale, "", "", "")
    }

    fn by_name(catalog: &[RegisterSpec], metric_name: &str) -> RegisterSpec {
        *catalog
            .iter()
            .find(|spec| spec.metric_name == metric_name)
            .unwrap()
    }

    #[test]
    fn single_register_is_scaled() {
        assert_eq!(spec(Single, 0.01).decode(&[5000]).unwrap(), 50.0);
        assert_eq!(spec(Single, 1.0).decode(&[42]).unwrap(), 42.0);
    }

    #[test]
    fn double_register_is_high_word_first() {
        assert_eq!(spec(Double, 0.1).decode(&[0x0000, 0x03E8]).unwrap(), 100.0);
        assert_eq!(spec(Double, 1.0).decode(&[0x0001, 0x0000]).unwrap(), 65536.0);
    }

    #[test]
    fn negative_scale_inverts_sign() {
        assert_eq!(spec(Single, -0.1).decode(&[100]).unwrap(), -10.0);
        assert_eq!(spec(Double, -0.1).decode(&[0, 1000]).unwrap(), -100.0);
    }

    #[test]
    fn word_count_must_match_width() {
        assert!(spec(Double, 1.0).decode(&[1]).is_err());
        assert!(spec(Single, 1.0).decode(&[1, 2]).is_err());
        assert!(spec(Single, 1.0).decode(&[]).is_err());
    }

    #[test]
    fn double_decode_round_trips() {
        for raw in [0u32, 1, 0xFFFF, 0x10000, 0xDEAD_BEEF, u32::MAX] {
            let words = [(raw >> 16) as Word, raw as Word];
            assert_eq!(spec(Double, 1.0).decode(&words).unwrap(), raw as f64);
        }
    }

    #[test]
    fn growatt_pv1_watts_matches_device_trace() {
        // words observed from a live SPF 5000: 1000 raw, 0.1 scale
        let spec = by_name(GROWATT_INPUT_REGISTERS, "pv1_watts");
        assert_eq!(spec.address, 3);
        assert_eq!(spec.width, Double);
        assert_eq!(spec.decode(&[0x0000, 0x03E8]).unwrap(), 100.0);
    }

    #[test]
    fn growatt_battery_volts_matches_device_trace() {
        let spec = by_name(GROWATT_INPUT_REGISTERS, "battery_volts");
        assert_eq!(spec.address, 17);
        assert_eq!(spec.width, Single);
        assert_eq!(spec.decode(&[5000]).unwrap(), 50.0);
    }

    #[test]
    fn metric_names_are_unique_per_family() {
        for kind in [DeviceKind::Growatt, DeviceKind::Epever] {
            let mut names: Vec<&str> = kind
                .input_registers()
                .iter()
                .chain(kind.holding_registers())
                .map(|spec| spec.metric_name)
                .collect();
            names.sort_unstable();
            let total = names.len();
            names.dedup();
            assert_eq!(names.len(), total, "{kind:?} catalog has duplicate names");
        }
    }

    #[test]
    fn synthetic_counter_names_are_not_cataloged() {
        for kind in [DeviceKind::Growatt, DeviceKind::Epever] {
            for spec in kind.input_registers().iter().chain(kind.holding_registers()) {
                assert_ne!(spec.metric_name, READ_SUCCEEDED_METRIC);
                assert_ne!(spec.metric_name, READ_FAILED_METRIC);
            }
        }
    }

    #[test]
    fn boost_reconnect_is_published_under_its_own_name() {
        let spec = by_name(EPEVER_HOLDING_REGISTERS, "settings_boost_reconnect_volts");
        assert_eq!(spec.address, 0x9009);
    }
}
