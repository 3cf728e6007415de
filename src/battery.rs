//! Battery telemetry model shared by all adapters.
//!
//! A [`BatteryState`] is created once when an adapter has been selected,
//! configured once and then refreshed in place every poll cycle. Every
//! telemetry field is optional until the first successful decode so that
//! "not yet known" is never confused with zero.

use crate::config::{BatteryConfig, TemperatureDerating};
use crate::control::ControlOutput;
use crate::Error;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Temperatures are clamped to this range before they are exposed.
pub const TEMPERATURE_RANGE: (f32, f32) = (-20.0, 100.0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(into = "u8")]
pub enum AlarmLevel {
    #[default]
    Normal,
    Warning,
    Alarm,
}

impl From<AlarmLevel> for u8 {
    fn from(level: AlarmLevel) -> u8 {
        match level {
            AlarmLevel::Normal => 0,
            AlarmLevel::Warning => 1,
            AlarmLevel::Alarm => 2,
        }
    }
}

impl AlarmLevel {
    /// `Alarm` if `active`, `Normal` otherwise.
    pub fn alarm_if(active: bool) -> Self {
        if active {
            AlarmLevel::Alarm
        } else {
            AlarmLevel::Normal
        }
    }
}

/// Alarm state of the battery. Every field stays `Normal` until an adapter
/// has classified it, a failed read never clears a previous alarm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Protection {
    pub voltage_high: AlarmLevel,
    pub voltage_low: AlarmLevel,
    pub voltage_cell_low: AlarmLevel,
    pub soc_low: AlarmLevel,
    pub charge_over_current: AlarmLevel,
    pub discharge_over_current: AlarmLevel,
    pub cell_imbalance: AlarmLevel,
    pub internal_failure: AlarmLevel,
    pub temp_high_charge: AlarmLevel,
    pub temp_low_charge: AlarmLevel,
    pub temp_high_discharge: AlarmLevel,
    pub temp_low_discharge: AlarmLevel,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cell {
    pub voltage: Option<f32>,
    pub balance: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureSensor {
    Internal,
    Battery1,
    Battery2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Nothing has been decoded yet.
    Unknown,
    /// The last update is older than the allowed age.
    Stale,
    Fresh,
}

/// Pack and cell limits derived from [`BatteryConfig`] and the cell count.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    pub min_cell_voltage: f32,
    pub max_cell_voltage: f32,
    pub min_battery_voltage: f32,
    pub min_battery_voltage_warning: f32,
    pub max_battery_voltage_warning: f32,
    pub max_battery_voltage: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
    pub temperature_derating: Option<TemperatureDerating>,
}

impl Limits {
    pub fn new(config: &BatteryConfig, cell_count: usize) -> Self {
        let cells = cell_count as f32;
        Self {
            min_cell_voltage: config.min_cell_voltage,
            max_cell_voltage: config.max_cell_voltage,
            min_battery_voltage: config.min_cell_voltage * cells,
            min_battery_voltage_warning: config.min_cell_voltage_warning * cells,
            max_battery_voltage_warning: config.max_cell_voltage_warning * cells,
            max_battery_voltage: config.max_cell_voltage * cells,
            max_charge_current: config.max_battery_current,
            max_discharge_current: config.max_battery_discharge_current,
            temperature_derating: config.temperature_derating,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new(&BatteryConfig::default(), 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatteryState {
    pub cell_count: usize,
    /// Installed capacity in Ah
    pub capacity_ah: Option<f32>,
    pub limits: Limits,
    pub hardware_version: Option<String>,
    pub software_version: Option<String>,

    /// Pack voltage in V
    pub voltage: Option<f32>,
    /// Pack current in A, positive while charging
    pub current: Option<f32>,
    /// State of charge in %
    pub soc: Option<f32>,
    pub cycles: Option<u32>,
    pub capacity_remaining_ah: Option<f32>,
    pub total_ah_drawn: Option<f32>,
    pub charge_fet: Option<bool>,
    pub discharge_fet: Option<bool>,
    pub balancing: Option<bool>,
    pub temperature_1: Option<f32>,
    pub temperature_2: Option<f32>,
    pub temperature_internal: Option<f32>,
    pub cells: Vec<Cell>,
    pub protection: Protection,

    /// Output of the last current limit computation
    pub control: Option<ControlOutput>,
    pub last_update: Option<Instant>,
}

impl BatteryState {
    pub fn is_configured(&self) -> bool {
        !self.cells.is_empty()
    }

    /// Fixes the cell count and derives the limits.
    ///
    /// The cell array is allocated on the first call only. Reconfiguring with a
    /// different cell count fails, cell indices stay stable for the process lifetime.
    pub fn configure(
        &mut self,
        cell_count: usize,
        capacity_ah: Option<f32>,
        config: &BatteryConfig,
    ) -> Result<(), Error> {
        if cell_count == 0 {
            return Err(Error::InvalidConfig("cell count must not be zero".to_string()));
        }
        if self.is_configured() {
            if self.cells.len() != cell_count {
                return Err(Error::CellCountMismatch {
                    configured: self.cells.len(),
                    reported: cell_count,
                });
            }
        } else {
            self.cells = vec![Cell::default(); cell_count];
        }
        self.cell_count = cell_count;
        self.capacity_ah = capacity_ah;
        self.limits = Limits::new(config, cell_count);
        log::info!(
            "Configured {} cells, capacity={:?}Ah, pack voltage {:.2}V-{:.2}V",
            cell_count,
            capacity_ah,
            self.limits.min_battery_voltage,
            self.limits.max_battery_voltage
        );
        Ok(())
    }

    /// Stores a temperature, clamped to [`TEMPERATURE_RANGE`] to mask sensor faults.
    pub fn set_temperature(&mut self, sensor: TemperatureSensor, value: f32) {
        let value = value.clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1);
        match sensor {
            TemperatureSensor::Internal => self.temperature_internal = Some(value),
            TemperatureSensor::Battery1 => self.temperature_1 = Some(value),
            TemperatureSensor::Battery2 => self.temperature_2 = Some(value),
        }
    }

    pub fn touch(&mut self) {
        self.last_update = Some(Instant::now());
    }

    pub fn freshness(&self, max_age: Duration) -> Freshness {
        match self.last_update {
            None => Freshness::Unknown,
            Some(at) if at.elapsed() > max_age => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }

    /// `true` once every configured cell has reported a voltage.
    pub fn all_cells_known(&self) -> bool {
        !self.cells.is_empty() && self.cells.iter().all(|c| c.voltage.is_some())
    }

    /// Index and voltage of the lowest cell. The first cell wins a tie.
    pub fn min_cell(&self) -> Option<(usize, f32)> {
        self.known_cells().fold(None, |lowest, (i, v)| match lowest {
            Some((_, lowest_v)) if lowest_v <= v => lowest,
            _ => Some((i, v)),
        })
    }

    /// Index and voltage of the highest cell. The first cell wins a tie.
    pub fn max_cell(&self) -> Option<(usize, f32)> {
        self.known_cells().fold(None, |highest, (i, v)| match highest {
            Some((_, highest_v)) if highest_v >= v => highest,
            _ => Some((i, v)),
        })
    }

    pub fn min_cell_voltage(&self) -> Option<f32> {
        self.min_cell().map(|(_, v)| v)
    }

    pub fn max_cell_voltage(&self) -> Option<f32> {
        self.max_cell().map(|(_, v)| v)
    }

    fn known_cells(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.cells
            .iter()
            .take(self.cell_count)
            .enumerate()
            .filter_map(|(i, c)| c.voltage.map(|v| (i, v)))
    }

    pub fn cell_description(index: usize) -> String {
        format!("C{}", index + 1)
    }

    pub fn is_balancing(&self) -> Option<bool> {
        let cells = self.cells.iter().filter_map(|c| c.balance).collect::<Vec<_>>();
        match (self.balancing, cells.is_empty()) {
            (None, true) => None,
            (flag, _) => Some(flag.unwrap_or(false) || cells.into_iter().any(|b| b)),
        }
    }

    fn temperatures(&self) -> impl Iterator<Item = f32> {
        [
            self.temperature_1,
            self.temperature_2,
            self.temperature_internal,
        ]
        .into_iter()
        .flatten()
    }

    /// Mean of all known temperatures, rounded to two decimals.
    pub fn temperature(&self) -> Option<f32> {
        let (sum, n) = self
            .temperatures()
            .fold((0.0, 0), |(sum, n), t| (sum + t, n + 1));
        if n == 0 {
            None
        } else {
            Some((sum / n as f32 * 100.0).round() / 100.0)
        }
    }

    pub fn min_temperature(&self) -> Option<f32> {
        self.temperatures().reduce(f32::min)
    }

    pub fn max_temperature(&self) -> Option<f32> {
        self.temperatures().reduce(f32::max)
    }

    /// Pack power in W, only when voltage, current and SOC are known.
    pub fn power(&self) -> Option<f32> {
        match (self.voltage, self.current, self.soc) {
            (Some(voltage), Some(current), Some(_)) => Some(voltage * current),
            _ => None,
        }
    }
}
