use anyhow::{Context, Result};
use log::{error, info, warn};
use serde_json::json;
use serialbattery_lib::driver::Driver;
use serialbattery_lib::gateway::{Gateway, DEFAULT_MAX_AGE};
use serialbattery_lib::snapshot::Snapshot;
use std::time::{Duration, Instant};

use crate::{commandline, mqtt};

fn fmt_value(value: Option<f32>, unit: &str) -> String {
    match value {
        Some(value) => format!("{value:.2}{unit}"),
        None => "-".to_string(),
    }
}

/// Human readable summary of a snapshot.
pub fn describe(snapshot: &Snapshot) -> String {
    let mut lines = vec![
        format!(
            "SOC: {}  Voltage: {}  Current: {}  Power: {}",
            fmt_value(snapshot.soc, "%"),
            fmt_value(snapshot.voltage, "V"),
            fmt_value(snapshot.current, "A"),
            fmt_value(snapshot.power, "W")
        ),
        format!(
            "Capacity: {} of {}  Cycles: {}",
            fmt_value(snapshot.capacity_remaining, "Ah"),
            fmt_value(snapshot.capacity_installed, "Ah"),
            snapshot
                .cycles
                .map_or_else(|| "-".to_string(), |c| c.to_string())
        ),
        format!(
            "Temperature: {} (min {}, max {})",
            fmt_value(snapshot.temperature, "°C"),
            fmt_value(snapshot.min_temperature, "°C"),
            fmt_value(snapshot.max_temperature, "°C")
        ),
        format!(
            "Cells: min {} {}  max {} {}  balancing: {:?}",
            fmt_value(snapshot.min_cell_voltage, "V"),
            snapshot.min_cell_id.as_deref().unwrap_or("-"),
            fmt_value(snapshot.max_cell_voltage, "V"),
            snapshot.max_cell_id.as_deref().unwrap_or("-"),
            snapshot.balancing
        ),
        format!("Cell voltages: {:?}", snapshot.cell_voltages),
        format!(
            "Charge: allowed {:?}, limit {}  Discharge: allowed {:?}, limit {}",
            snapshot.allow_to_charge,
            fmt_value(snapshot.max_charge_current, "A"),
            snapshot.allow_to_discharge,
            fmt_value(snapshot.max_discharge_current, "A")
        ),
        format!("Alarms: {:?}", snapshot.alarms),
    ];
    if let (Some(hardware), Some(software)) = (&snapshot.hardware_version, &snapshot.software_version)
    {
        lines.push(format!("Version: {hardware}, {software}"));
    }
    lines.push(format!("Data: {:?}", snapshot.freshness));
    lines.join("\n")
}

/// Flattens `value` into one `(topic, payload)` pair per leaf. Nulls are skipped.
fn flatten_simple_format(topic: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_simple_format(&format!("{topic}/{k}"), v, out);
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, v) in arr.iter().enumerate() {
                flatten_simple_format(&format!("{topic}/{i}"), v, out);
            }
        }
        serde_json::Value::String(s) => out.push((topic.to_string(), s.clone())),
        serde_json::Value::Number(n) => out.push((topic.to_string(), n.to_string())),
        serde_json::Value::Bool(b) => out.push((topic.to_string(), b.to_string())),
        serde_json::Value::Null => {}
    }
}

fn json_payload(snapshot: &Snapshot) -> Result<String> {
    let mut value = serde_json::to_value(snapshot)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "timestamp".to_string(),
            json!(chrono::Utc::now().to_rfc3339()),
        );
    }
    Ok(serde_json::to_string(&value)?)
}

fn publish(
    publisher: &mut mqtt::MqttPublisher,
    format: &commandline::MqttFormat,
    snapshot: &Snapshot,
) -> Result<()> {
    let base_topic = publisher.topic().to_string();
    match format {
        commandline::MqttFormat::Json => {
            let payload = json_payload(snapshot)?;
            publisher.publish(&base_topic, &payload)?;
        }
        commandline::MqttFormat::Simple => {
            let mut messages = Vec::new();
            flatten_simple_format(&base_topic, &serde_json::to_value(snapshot)?, &mut messages);
            for (topic, payload) in messages {
                if let Err(e) = publisher.publish(&topic, &payload) {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
        }
    }
    Ok(())
}

pub fn run<D: Driver>(
    mut gateway: Gateway<D>,
    output: commandline::DaemonOutput,
    interval: Duration,
) -> Result<()> {
    info!(
        "Starting daemon mode: adapter={}, output={output:?}, interval={interval:?}",
        gateway.driver().name()
    );
    gateway.set_max_age(DEFAULT_MAX_AGE.max(interval * 3));

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;

    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        mqtt_publisher = Some(publisher);
    }

    loop {
        let started = Instant::now();
        let snapshot = gateway
            .poll()
            .with_context(|| "Lost connection to the battery")?;

        match &output {
            commandline::DaemonOutput::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                println!("{}", describe(&snapshot));
                println!("--------------------------");
            }
            commandline::DaemonOutput::Mqtt { format, .. } => {
                if let Some(publisher) = &mut mqtt_publisher {
                    if let Err(e) = publish(publisher, format, &snapshot) {
                        error!("Failed to publish data to MQTT: {e:?}");
                    }
                } else {
                    warn!("MQTT output selected, but publisher is not initialized. Skipping publish.");
                }
            }
        }
        std::thread::sleep(interval.saturating_sub(started.elapsed()));
    }
}
