//! The Home Assistant MQTT bridge.
//!
//! On connect the bridge advertises every input register as a sensor with a
//! retained discovery message, then publishes the latest snapshot as one
//! JSON object every [`PUBLISH_PERIOD`]. Empty snapshots are suppressed
//! rather than published, so subscribers see either the newest data or
//! nothing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use log::{debug, info, warn};
use paho_mqtt::{Client, ConnectOptionsBuilder, CreateOptionsBuilder, Message};
use serde::{Deserialize, Serialize};

use crate::protocol::{DeviceKind, RegisterSpec};
use crate::store::{SharedState, Snapshot};

/// Time between state publications.
pub const PUBLISH_PERIOD: Duration = Duration::from_secs(15);

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
const QOS: i32 = 0;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_operation_timeout",
        with = "humantime_serde"
    )]
    operation_timeout: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distr::Alphanumeric;
        use rand::RngExt;

        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("solar-exporter-{}", Self::generate_random_string(8))
    }

    fn default_operation_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Creates the client and connects to the broker. A failure here is
    /// fatal to the bridge.
    pub fn create_client(&self) -> Result<Client> {
        let create_opts = CreateOptionsBuilder::new()
            .server_uri(format!("mqtt://{}:{}", self.host, self.port))
            .client_id(&self.client_id)
            .persistence(None) // In-memory persistence
            .finalize();

        let mut client = Client::new(create_opts)
            .with_context(|| format!("Error creating MQTT client for {}:{}", self.host, self.port))?;

        client.set_timeout(self.operation_timeout);

        let mut conn_builder = ConnectOptionsBuilder::new();
        conn_builder
            .keep_alive_interval(KEEP_ALIVE_INTERVAL)
            .clean_session(true);

        if let Some(username) = &self.username {
            conn_builder.user_name(username.as_str());
        }
        if let Some(password) = &self.password {
            conn_builder.password(password.as_str());
        }
        let conn_opts = conn_builder.finalize();

        info!(
            "Attempting to connect to MQTT broker: {}:{} with client_id: {}",
            self.host, self.port, self.client_id
        );

        client
            .connect(conn_opts)
            .with_context(|| "Failed to connect to MQTT broker")?;
        info!("Connected to the MQTT broker");
        Ok(client)
    }
}

/// Home Assistant discovery payload, one retained message per sensor.
/// Empty annotations are left out of the JSON entirely, they must not be
/// published as empty strings.
#[derive(Debug, Serialize)]
struct DiscoveryPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
    state_topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    value_template: String,
    name: &'a str,
    unique_id: String,
    device: DeviceIdentification<'a>,
}

#[derive(Debug, Serialize)]
struct DeviceIdentification<'a> {
    identifiers: [&'a str; 1],
    name: &'a str,
    manufacturer: &'a str,
}

fn non_empty(annotation: &'static str) -> Option<&'static str> {
    if annotation.is_empty() {
        None
    } else {
        Some(annotation)
    }
}

fn state_topic(kind: DeviceKind) -> String {
    format!("homeassistant/sensor/{}/state", kind.metric_prefix())
}

fn discovery_payload(kind: DeviceKind, state_topic: &str, spec: &RegisterSpec) -> Result<String> {
    let unique_id = format!("{}_{}", kind.metric_prefix(), spec.metric_name);
    let payload = DiscoveryPayload {
        device_class: non_empty(spec.device_class),
        state_class: non_empty(spec.state_class),
        state_topic,
        unit_of_measurement: non_empty(spec.unit),
        value_template: format!("{{{{value_json.{}}}}}", spec.metric_name),
        name: spec.human_name,
        unique_id,
        device: DeviceIdentification {
            identifiers: ["1"],
            name: kind.display_name(),
            manufacturer: kind.display_name(),
        },
    };
    Ok(serde_json::to_string(&payload)?)
}

/// Advertises every input register to Home Assistant.
fn publish_discovery(client: &Client, kind: DeviceKind) -> Result<()> {
    let state_topic = state_topic(kind);
    for spec in kind.input_registers() {
        let unique_id = format!("{}_{}", kind.metric_prefix(), spec.metric_name);
        let topic = format!("homeassistant/sensor/{unique_id}/config");
        let message = Message::new_retained(
            topic.as_str(),
            discovery_payload(kind, &state_topic, spec)?,
            QOS,
        );
        client
            .publish(message)
            .with_context(|| format!("Cannot publish discovery for {unique_id}"))?;
    }
    info!(
        "Published discovery for {} sensors",
        kind.input_registers().len()
    );
    Ok(())
}

/// The snapshot as a single JSON object keyed by metric name.
fn state_payload(snapshot: &Snapshot) -> String {
    let object: serde_json::Map<String, serde_json::Value> = snapshot
        .readings
        .iter()
        .map(|reading| (reading.name.to_string(), reading.value.into()))
        .collect();
    serde_json::Value::Object(object).to_string()
}

/// Connects, advertises the sensors, then bridges the snapshot to the state
/// topic until shutdown. A broker-connect failure is fatal; a publish
/// failure is logged and retried at the next period.
pub fn run(config_file: &str, kind: DeviceKind, state: &Arc<SharedState>) -> Result<()> {
    let config = MqttConfig::load(config_file)?;
    let client = config.create_client()?;
    publish_discovery(&client, kind)?;

    let state_topic = state_topic(kind);
    while state.keep_running() {
        let snapshot = state.metrics.snapshot();
        if snapshot.readings.is_empty() {
            // don't publish empty metrics
            debug!("Nothing to publish yet");
        } else {
            let payload = state_payload(&snapshot);
            info!("Publishing status ({} bytes) to broker...", payload.len());
            if let Err(e) = client.publish(Message::new(state_topic.as_str(), payload, QOS)) {
                warn!("Cannot publish status: {e}");
            }
        }

        debug!(
            "Waiting {}...",
            humantime::format_duration(PUBLISH_PERIOD)
        );
        for _ in 0..PUBLISH_PERIOD.as_secs() {
            std::thread::sleep(Duration::from_secs(1));
            if !state.keep_running() {
                break;
            }
        }
    }

    info!("MQTT bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Reading;
    use serde_json::{json, Value};

    fn spec_by_name(kind: DeviceKind, metric_name: &str) -> &'static RegisterSpec {
        kind.input_registers()
            .iter()
            .find(|spec| spec.metric_name == metric_name)
            .unwrap()
    }

    #[test]
    fn discovery_payload_carries_the_sensor_metadata() {
        let spec = spec_by_name(DeviceKind::Growatt, "battery_volts");
        let payload: Value =
            serde_json::from_str(&discovery_payload(DeviceKind::Growatt, "topic", spec).unwrap()).unwrap();

        assert_eq!(payload["device_class"], "voltage");
        assert_eq!(payload["unit_of_measurement"], "V");
        assert_eq!(payload["state_topic"], "topic");
        assert_eq!(payload["value_template"], "{{value_json.battery_volts}}");
        assert_eq!(payload["name"], "battery voltage");
        assert_eq!(payload["unique_id"], "growatt_battery_volts");
        assert_eq!(
            payload["device"],
            json!({"identifiers": ["1"], "name": "Growatt", "manufacturer": "Growatt"})
        );
    }

    #[test]
    fn empty_annotations_are_omitted_entirely() {
        let spec = spec_by_name(DeviceKind::Growatt, "system_status");
        let payload: Value =
            serde_json::from_str(&discovery_payload(DeviceKind::Growatt, "topic", spec).unwrap()).unwrap();

        let object = payload.as_object().unwrap();
        assert!(!object.contains_key("device_class"));
        assert!(!object.contains_key("unit_of_measurement"));
        assert!(!object.contains_key("state_class"));
    }

    #[test]
    fn cumulative_counters_advertise_their_state_class() {
        let spec = spec_by_name(DeviceKind::Growatt, "energy_pv_total_kwh");
        let payload: Value =
            serde_json::from_str(&discovery_payload(DeviceKind::Growatt, "topic", spec).unwrap()).unwrap();

        assert_eq!(payload["state_class"], "total_increasing");
        assert_eq!(payload["device_class"], "energy");
    }

    #[test]
    fn state_payload_is_one_object_keyed_by_metric() {
        let snapshot = Snapshot {
            readings: vec![
                Reading { name: "battery_volts", value: 50.0 },
                Reading { name: "pv1_watts", value: 100.5 },
            ],
            succeeded: 2,
            failed: 0,
        };

        let payload: Value = serde_json::from_str(&state_payload(&snapshot)).unwrap();
        assert_eq!(
            payload,
            json!({"battery_volts": 50.0, "pv1_watts": 100.5})
        );
    }

    #[test]
    fn state_topics_follow_the_home_assistant_hierarchy() {
        assert_eq!(state_topic(DeviceKind::Growatt), "homeassistant/sensor/growatt/state");
        assert_eq!(state_topic(DeviceKind::Epever), "homeassistant/sensor/epever/state");
    }
}
