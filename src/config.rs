use crate::Error;
use serde::{Deserialize, Serialize};

/// Static per-deployment battery configuration.
///
/// Cell limits are given per cell, pack limits are derived from them once the
/// cell count is known (see [`crate::battery::Limits`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub min_cell_voltage: f32,
    pub min_cell_voltage_warning: f32,
    pub max_cell_voltage_warning: f32,
    pub max_cell_voltage: f32,
    /// Maximum charge current in A
    pub max_battery_current: f32,
    /// Maximum discharge current in A
    pub max_battery_discharge_current: f32,
    /// Number of cells in series. Taken from the BMS when not set.
    pub cell_count: Option<usize>,
    /// Installed capacity in Ah. Taken from the BMS when not set.
    pub capacity_ah: Option<f32>,
    /// Derate currents at low temperature. Disabled when not set.
    pub temperature_derating: Option<TemperatureDerating>,
    /// Broker the push-based JK BMS adapter subscribes to.
    pub mqtt: MqttSourceConfig,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            min_cell_voltage: 3.05,
            min_cell_voltage_warning: 3.20,
            max_cell_voltage_warning: 3.45,
            max_cell_voltage: 3.55,
            max_battery_current: 80.0,
            max_battery_discharge_current: 80.0,
            cell_count: None,
            capacity_ah: None,
            temperature_derating: None,
            mqtt: MqttSourceConfig::default(),
        }
    }
}

impl BatteryConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.min_cell_voltage < self.min_cell_voltage_warning
            && self.min_cell_voltage_warning < self.max_cell_voltage_warning
            && self.max_cell_voltage_warning < self.max_cell_voltage)
        {
            return Err(Error::InvalidConfig(format!(
                "cell voltages must be ordered min < min warning < max warning < max, got {} {} {} {}",
                self.min_cell_voltage,
                self.min_cell_voltage_warning,
                self.max_cell_voltage_warning,
                self.max_cell_voltage
            )));
        }
        if self.max_battery_current < 0.0 || self.max_battery_discharge_current < 0.0 {
            return Err(Error::InvalidConfig(
                "current limits must not be negative".to_string(),
            ));
        }
        if self.cell_count == Some(0) {
            return Err(Error::InvalidConfig("cell count must not be zero".to_string()));
        }
        if let Some(derating) = &self.temperature_derating {
            if derating.cutoff >= derating.warn {
                return Err(Error::InvalidConfig(format!(
                    "derating cutoff {} must be below warn {}",
                    derating.cutoff, derating.warn
                )));
            }
        }
        Ok(())
    }
}

/// Low temperature derating: full current at or above `warn`, none at or below `cutoff`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureDerating {
    pub warn: f32,
    pub cutoff: f32,
}

impl Default for TemperatureDerating {
    fn default() -> Self {
        Self {
            warn: 10.0,
            cutoff: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSourceConfig {
    pub host: String,
    pub port: u16,
    pub topic_prefix: String,
    pub client_id: String,
}

impl Default for MqttSourceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            topic_prefix: "jkbms".to_string(),
            client_id: "serialbattery-jkbms".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BatteryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_cell_voltage, 3.55);
        assert_eq!(config.max_battery_current, 80.0);
    }

    #[test]
    fn unordered_voltages_are_rejected() {
        let config = BatteryConfig {
            max_cell_voltage_warning: 3.60,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn inverted_derating_is_rejected() {
        let config = BatteryConfig {
            temperature_derating: Some(TemperatureDerating {
                warn: 4.0,
                cutoff: 8.0,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
