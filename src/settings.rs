use anyhow::{Context, Result};
use serialbattery_lib::config::BatteryConfig;

/// Loads the battery configuration, or the built-in defaults without a file.
pub fn load_battery_config(config_file_path: Option<&str>) -> Result<BatteryConfig> {
    let Some(config_file_path) = config_file_path else {
        log::debug!("No battery config file given, using defaults");
        return Ok(BatteryConfig::default());
    };
    log::debug!("Loading battery config from {config_file_path:?}");
    let config_file = std::fs::File::open(config_file_path)
        .with_context(|| format!("Cannot open battery config file {config_file_path:?}"))?;
    let config: BatteryConfig = serde_yaml::from_reader(&config_file)
        .with_context(|| format!("Cannot read battery config from file: {config_file_path:?}"))?;
    config
        .validate()
        .with_context(|| format!("Invalid battery config in {config_file_path:?}"))?;
    log::info!("Loaded battery config from {config_file_path}: {config:?}");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_file() {
        assert_eq!(load_battery_config(None).unwrap(), BatteryConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = config_file(
            "max_cell_voltage: 3.60\n\
             cell_count: 8\n\
             temperature_derating:\n  warn: 8\n  cutoff: 4\n\
             mqtt:\n  host: broker.local\n",
        );
        let config = load_battery_config(file.path().to_str()).unwrap();
        assert_eq!(config.max_cell_voltage, 3.60);
        assert_eq!(config.min_cell_voltage, 3.05);
        assert_eq!(config.cell_count, Some(8));
        assert_eq!(config.temperature_derating.map(|d| d.cutoff), Some(4.0));
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let file = config_file("max_battery_current: -5\n");
        assert!(load_battery_config(file.path().to_str()).is_err());
    }

    #[test]
    fn missing_file() {
        assert!(load_battery_config(Some("/nonexistent/battery.yaml")).is_err());
    }
}
