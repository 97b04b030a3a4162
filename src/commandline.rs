use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use solar_exporter_lib::protocol::DeviceKind;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceType {
    /// Growatt SPF storage inverter (RTU at 9600 baud)
    Growatt,
    /// EPEVER charge controller (RTU at 115200 baud)
    Epever,
}

impl DeviceType {
    pub fn kind(self) -> DeviceKind {
        match self {
            DeviceType::Growatt => DeviceKind::Growatt,
            DeviceType::Epever => DeviceKind::Epever,
        }
    }
}

const fn about_text() -> &'static str {
    "Prometheus and MQTT exporter for EPEVER and Growatt solar hardware"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial device path (e.g. /dev/ttyUSB0) or TCP address (e.g. 192.168.1.50:502)
    pub device_or_uri: String,

    /// Device family to poll
    #[arg(long, value_enum, default_value_t = DeviceType::Growatt)]
    pub device_type: DeviceType,

    /// Serve Prometheus metrics on this port
    #[arg(long, value_name = "PORT")]
    pub prometheus: Option<u16>,

    /// Bridge to Home Assistant using this MQTT configuration file
    #[arg(long, value_name = "FILE")]
    pub mqtt_config: Option<String>,

    /// Modbus Input/Output operations timeout, overriding the family default
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporters_are_optional_flags() {
        let args = Args::try_parse_from([
            "solar-exporter",
            "/dev/ttyUSB0",
            "--device-type",
            "epever",
            "--prometheus",
            "9100",
        ])
        .unwrap();

        assert_eq!(args.device_or_uri, "/dev/ttyUSB0");
        assert_eq!(args.device_type.kind(), DeviceKind::Epever);
        assert_eq!(args.prometheus, Some(9100));
        assert_eq!(args.mqtt_config, None);
    }

    #[test]
    fn device_or_uri_is_required() {
        assert!(Args::try_parse_from(["solar-exporter"]).is_err());
    }

    #[test]
    fn timeout_accepts_humantime() {
        let args =
            Args::try_parse_from(["solar-exporter", "192.168.1.50:502", "--timeout", "500ms"])
                .unwrap();
        assert_eq!(args.timeout, Some(Duration::from_millis(500)));
    }
}
