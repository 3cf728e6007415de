//! JK BMS values pushed over MQTT.
//!
//! A bridge publishes every value on its own topic,
//! `<prefix>/<device>/<key>/value`. A receiver thread parses each message
//! into a [`FieldUpdate`] and queues it. [`Driver::refresh`] drains the queue
//! into the battery state and derives the alarms locally, there is no
//! protection word on this transport.

use crate::battery::{AlarmLevel, BatteryState, TemperatureSensor};
use crate::config::{BatteryConfig, MqttSourceConfig};
use crate::driver::Driver;
use crate::Error;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::Duration;

pub const DEFAULT_CELL_COUNT: usize = 16;
pub const DEFAULT_CAPACITY_AH: f32 = 280.0;
/// MOSFET temperature in °C above which both high temperature alarms are raised
pub const MOSFET_TEMPERATURE_LIMIT: f32 = 50.0;
/// Cell voltages at or below this are treated as "not reported"
const CELL_VOLTAGE_FLOOR: f32 = 0.1;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// One value received from the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Voltage(f32),
    /// A, positive while charging
    Current(f32),
    Soc(f32),
    Temperature(TemperatureSensor, f32),
    MosfetTemperature(f32),
    /// 0-based cell index
    CellVoltage(usize, f32),
    Cycles(u32),
    CapacityRemaining(f32),
    TotalAhDrawn(f32),
    Balancing(bool),
    HardwareVersion(String),
    SoftwareVersion(String),
}

/// Parses a bridge message. Messages which carry no usable value yield `None`.
pub fn parse_message(topic: &str, payload: &[u8]) -> Option<FieldUpdate> {
    let parts = topic.split('/').collect::<Vec<_>>();
    let [_, _, key, "value"] = parts.as_slice() else {
        return None;
    };
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    let number = text.parse::<f32>().ok().filter(|v| v.is_finite());

    let update = match (*key, number) {
        ("battery_voltage", Some(v)) => FieldUpdate::Voltage(v),
        ("current_charge", Some(v)) if v > 0.0 => FieldUpdate::Current(v),
        ("current_discharge", Some(v)) if v > 0.0 => FieldUpdate::Current(-v),
        ("current_charge" | "current_discharge", Some(_)) => return None,
        ("percent_remain", Some(v)) => FieldUpdate::Soc(v),
        ("battery_t1", Some(v)) => FieldUpdate::Temperature(TemperatureSensor::Battery1, v),
        ("battery_t2", Some(v)) => FieldUpdate::Temperature(TemperatureSensor::Battery2, v),
        ("mos_temp", Some(v)) => FieldUpdate::MosfetTemperature(v),
        ("cycle_count", Some(v)) => FieldUpdate::Cycles(v as u32),
        ("capacity_remain", Some(v)) => FieldUpdate::CapacityRemaining(v),
        ("cycle_capacity", Some(v)) => FieldUpdate::TotalAhDrawn(v),
        ("balance_current", Some(v)) => FieldUpdate::Balancing(v > 0.0),
        ("hardware_version", _) => FieldUpdate::HardwareVersion(format!("JKBMS HW {text}")),
        ("software_version", _) => FieldUpdate::SoftwareVersion(format!("JKBMS SW {text}")),
        (key, Some(v)) if key.starts_with("voltage_cell") => {
            let index = key["voltage_cell".len()..]
                .parse::<usize>()
                .ok()?
                .checked_sub(1)?;
            FieldUpdate::CellVoltage(index, v)
        }
        (key, _) => {
            log::debug!("Unparsed message {key}={text}");
            return None;
        }
    };
    log::trace!("{topic} -> {update:?}");
    Some(update)
}

fn apply(update: FieldUpdate, state: &mut BatteryState, mosfet_temperature: &mut Option<f32>) {
    match update {
        FieldUpdate::Voltage(v) => state.voltage = Some(v),
        FieldUpdate::Current(v) => state.current = Some(v),
        FieldUpdate::Soc(v) => state.soc = Some(v),
        FieldUpdate::Temperature(sensor, v) => state.set_temperature(sensor, v),
        FieldUpdate::MosfetTemperature(v) => *mosfet_temperature = Some(v),
        FieldUpdate::CellVoltage(index, v) => match state.cells.get_mut(index) {
            Some(cell) => cell.voltage = Some(v),
            None => log::debug!("Ignoring voltage of cell {} beyond {}", index + 1, state.cell_count),
        },
        FieldUpdate::Cycles(v) => state.cycles = Some(v),
        FieldUpdate::CapacityRemaining(v) => state.capacity_remaining_ah = Some(v),
        FieldUpdate::TotalAhDrawn(v) => state.total_ah_drawn = Some(v),
        FieldUpdate::Balancing(v) => state.balancing = Some(v),
        FieldUpdate::HardwareVersion(v) => state.hardware_version = Some(v),
        FieldUpdate::SoftwareVersion(v) => state.software_version = Some(v),
    }
}

/// Alarms derived from the accumulated values.
fn derive_protection(state: &mut BatteryState, mosfet_temperature: Option<f32>) {
    if state.cells.iter().any(|c| c.voltage.is_some()) {
        let lowest = if state.all_cells_known() {
            state.min_cell_voltage()
        } else {
            None
        };
        let min = state.limits.min_cell_voltage;
        state.protection.voltage_cell_low = match lowest {
            Some(v) if v > CELL_VOLTAGE_FLOOR && v < min - 0.1 => AlarmLevel::Alarm,
            Some(v) if v > CELL_VOLTAGE_FLOOR && v < min => AlarmLevel::Warning,
            _ => AlarmLevel::Normal,
        };
    }
    if let Some(voltage) = state.voltage {
        state.protection.voltage_high =
            AlarmLevel::alarm_if(voltage > state.limits.max_battery_voltage);
        state.protection.voltage_low =
            AlarmLevel::alarm_if(voltage < state.limits.min_battery_voltage);
    }
    if let Some(t) = mosfet_temperature {
        let hot = AlarmLevel::alarm_if(t > MOSFET_TEMPERATURE_LIMIT);
        state.protection.temp_high_charge = hot;
        state.protection.temp_high_discharge = hot;
    }
}

pub struct JkMqtt {
    updates: Receiver<FieldUpdate>,
    client: Option<Client>,
    mosfet_temperature: Option<f32>,
}

impl JkMqtt {
    /// Connects to the broker and starts the receiver thread.
    pub fn connect(config: &MqttSourceConfig) -> Result<Self, Error> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(60));
        let (client, mut connection) = Client::new(options, 10);
        let (sender, receiver) = mpsc::channel();

        let mut subscriber = client.clone();
        let filter = format!("{}/#", config.topic_prefix);
        log::info!(
            "Connecting to {}:{} for {}",
            config.host,
            config.port,
            filter
        );
        std::thread::Builder::new()
            .name("jkbms-mqtt".to_string())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("Connected, subscribing to {filter}");
                            if let Err(err) = subscriber.subscribe(filter.as_str(), QoS::AtMostOnce)
                            {
                                log::error!("Cannot subscribe to {filter}: {err}");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if let Some(update) = parse_message(&publish.topic, &publish.payload) {
                                if sender.send(update).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            log::warn!("MQTT connection error: {err}");
                            std::thread::sleep(RECONNECT_DELAY);
                        }
                    }
                }
                log::debug!("MQTT receiver stopped");
            })?;

        Ok(Self {
            updates: receiver,
            client: Some(client),
            mosfet_temperature: None,
        })
    }

    /// Adapter fed from an existing queue instead of a broker.
    pub fn from_receiver(updates: Receiver<FieldUpdate>) -> Self {
        Self {
            updates,
            client: None,
            mosfet_temperature: None,
        }
    }
}

impl Drop for JkMqtt {
    fn drop(&mut self) {
        if let Some(client) = self.client.as_mut() {
            if let Err(err) = client.disconnect() {
                log::debug!("Cannot disconnect: {err}");
            }
        }
    }
}

impl Driver for JkMqtt {
    fn name(&self) -> &str {
        "JKBMS MQTT"
    }

    fn test_connection(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn configure(
        &mut self,
        state: &mut BatteryState,
        config: &BatteryConfig,
    ) -> Result<(), Error> {
        let cell_count = config.cell_count.unwrap_or(DEFAULT_CELL_COUNT);
        let capacity = config.capacity_ah.unwrap_or(DEFAULT_CAPACITY_AH);
        state.configure(cell_count, Some(capacity), config)?;
        state.charge_fet = Some(true);
        state.discharge_fet = Some(true);
        state.balancing = Some(false);
        state.hardware_version = Some(format!("JKBMS {cell_count} cells"));
        state.software_version = Some("JKBMS V0.1".to_string());
        Ok(())
    }

    fn refresh(&mut self, state: &mut BatteryState) -> Result<(), Error> {
        let mut applied = 0;
        loop {
            match self.updates.try_recv() {
                Ok(update) => {
                    apply(update, state, &mut self.mosfet_temperature);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(Error::TransportClosed(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "MQTT receiver stopped",
                    )));
                }
            }
        }
        if applied > 0 {
            log::debug!("Applied {applied} updates");
            state.touch();
        }
        derive_protection(state, self.mosfet_temperature);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Sender;

    fn configured() -> (Sender<FieldUpdate>, JkMqtt, BatteryState) {
        let (sender, receiver) = mpsc::channel();
        let mut driver = JkMqtt::from_receiver(receiver);
        let mut state = BatteryState::default();
        driver
            .configure(&mut state, &BatteryConfig::default())
            .unwrap();
        (sender, driver, state)
    }

    #[test]
    fn messages_are_parsed() {
        assert_eq!(
            parse_message("jkbms/bms1/battery_voltage/value", b"52.81"),
            Some(FieldUpdate::Voltage(52.81))
        );
        assert_eq!(
            parse_message("jkbms/bms1/voltage_cell03/value", b"3.301"),
            Some(FieldUpdate::CellVoltage(2, 3.301))
        );
        assert_eq!(
            parse_message("jkbms/bms1/current_discharge/value", b"12.5"),
            Some(FieldUpdate::Current(-12.5))
        );
        assert_eq!(
            parse_message("jkbms/bms1/current_charge/value", b"0"),
            None
        );
        assert_eq!(
            parse_message("jkbms/bms1/balance_current/value", b"0.3"),
            Some(FieldUpdate::Balancing(true))
        );
        assert_eq!(
            parse_message("jkbms/bms1/software_version/value", b"11.26"),
            Some(FieldUpdate::SoftwareVersion("JKBMS SW 11.26".to_string()))
        );
        assert_eq!(
            parse_message("jkbms/bms1/cycle_count/value", b"17"),
            Some(FieldUpdate::Cycles(17))
        );
    }

    #[test]
    fn unusable_messages_are_ignored() {
        assert_eq!(parse_message("jkbms/bms1/battery_voltage/set", b"1"), None);
        assert_eq!(parse_message("jkbms/battery_voltage/value", b"1"), None);
        assert_eq!(parse_message("jkbms/bms1/battery_voltage/value", b"n/a"), None);
        assert_eq!(parse_message("jkbms/bms1/voltage_cell00/value", b"3.3"), None);
        assert_eq!(parse_message("jkbms/bms1/unknown_key/value", b"3"), None);
        assert_eq!(parse_message("jkbms/bms1/battery_voltage/value", b"NaN"), None);
        assert_eq!(parse_message("jkbms/bms1/percent_remain/value", b"inf"), None);
    }

    #[test]
    fn non_finite_voltage_keeps_fail_safe() {
        let (sender, mut driver, mut state) = configured();
        for i in 0..16 {
            sender.send(FieldUpdate::CellVoltage(i, 3.3)).unwrap();
        }
        sender.send(FieldUpdate::Soc(80.0)).unwrap();
        if let Some(update) = parse_message("jkbms/bms1/battery_voltage/value", b"NaN") {
            sender.send(update).unwrap();
        }
        driver.refresh(&mut state).unwrap();
        assert_eq!(state.voltage, None);
        assert_eq!(crate::control::compute(&state), crate::control::ControlOutput::FAIL_SAFE);
    }

    #[test]
    fn configure_uses_defaults() {
        let (_sender, driver, state) = configured();
        assert_eq!(driver.name(), "JKBMS MQTT");
        assert_eq!(state.cell_count, 16);
        assert_eq!(state.capacity_ah, Some(280.0));
        assert_eq!(state.charge_fet, Some(true));
        assert_eq!(state.balancing, Some(false));
        assert_eq!(state.hardware_version.as_deref(), Some("JKBMS 16 cells"));
    }

    #[test]
    fn refresh_drains_queue() {
        let (sender, mut driver, mut state) = configured();
        driver.refresh(&mut state).unwrap();
        assert!(state.last_update.is_none());

        sender.send(FieldUpdate::Voltage(52.8)).unwrap();
        sender.send(FieldUpdate::Soc(64.0)).unwrap();
        sender.send(FieldUpdate::CellVoltage(0, 3.31)).unwrap();
        sender.send(FieldUpdate::CellVoltage(40, 3.31)).unwrap();
        driver.refresh(&mut state).unwrap();
        assert_eq!(state.voltage, Some(52.8));
        assert_eq!(state.soc, Some(64.0));
        assert_eq!(state.cells[0].voltage, Some(3.31));
        assert_eq!(state.cells.len(), 16);
        assert!(state.last_update.is_some());

        // Values stay until a new message names them
        sender.send(FieldUpdate::Soc(65.0)).unwrap();
        driver.refresh(&mut state).unwrap();
        assert_eq!(state.voltage, Some(52.8));
        assert_eq!(state.soc, Some(65.0));
    }

    #[test]
    fn protection_is_derived() {
        let (sender, mut driver, mut state) = configured();
        for i in 0..16 {
            sender.send(FieldUpdate::CellVoltage(i, 3.3)).unwrap();
        }
        sender.send(FieldUpdate::Voltage(58.0)).unwrap();
        sender.send(FieldUpdate::MosfetTemperature(55.0)).unwrap();
        driver.refresh(&mut state).unwrap();
        assert_eq!(state.protection.voltage_high, AlarmLevel::Alarm);
        assert_eq!(state.protection.voltage_low, AlarmLevel::Normal);
        assert_eq!(state.protection.temp_high_charge, AlarmLevel::Alarm);
        assert_eq!(state.protection.temp_high_discharge, AlarmLevel::Alarm);
        assert_eq!(state.protection.voltage_cell_low, AlarmLevel::Normal);

        sender.send(FieldUpdate::CellVoltage(5, 3.0)).unwrap();
        sender.send(FieldUpdate::MosfetTemperature(40.0)).unwrap();
        driver.refresh(&mut state).unwrap();
        assert_eq!(state.protection.voltage_cell_low, AlarmLevel::Warning);
        assert_eq!(state.protection.temp_high_charge, AlarmLevel::Normal);

        sender.send(FieldUpdate::CellVoltage(5, 2.9)).unwrap();
        driver.refresh(&mut state).unwrap();
        assert_eq!(state.protection.voltage_cell_low, AlarmLevel::Alarm);
    }

    #[test]
    fn stopped_receiver_is_a_transport_error() {
        let (sender, mut driver, mut state) = configured();
        drop(sender);
        let err = driver.refresh(&mut state).unwrap_err();
        assert!(err.is_transport_closed());
    }
}
