use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serialbattery_lib::gateway::DEFAULT_MAX_TRANSPORT_FAILURES;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Probe the device and show which adapter answers
    Probe,
    /// Read the battery once and show telemetry, alarms and current limits
    Status {
        /// Print the snapshot as JSON
        #[clap(long, action)]
        json: bool,
    },
    /// Run the poll cycle, publishing a snapshot every interval
    Daemon {
        /// Output destination for snapshots
        #[command(subcommand)]
        output: DaemonOutput,
        /// Poll interval (e.g., "1s", "500ms")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "1s")]
        interval: Duration,
        /// Consecutive transport failures tolerated before exiting
        #[clap(long, default_value_t = DEFAULT_MAX_TRANSPORT_FAILURES)]
        max_transport_failures: u32,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print every snapshot to the standard output (console).
    Console,
    /// Publish every snapshot to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "JK BMS gateway: telemetry and charge/discharge current limits"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows).
    /// Names starting with "jkbms" subscribe to values pushed over MQTT instead.
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O operations (e.g., "100ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "100ms")]
    pub timeout: Duration,

    /// Battery configuration file (YAML), built-in limits are used when not given
    #[arg(long, short)]
    pub config: Option<String>,

    /// Only probe the adapter with this index
    #[arg(long)]
    pub driver: Option<usize>,
}
