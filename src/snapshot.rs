//! Read-only view of a [`BatteryState`] handed to publishers once per cycle.
//!
//! Values that are not known serialize as `null`, never as zero.

use crate::battery::{BatteryState, Freshness, Protection};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// %
    pub soc: Option<f32>,
    /// V
    pub voltage: Option<f32>,
    /// A, positive while charging
    pub current: Option<f32>,
    /// W
    pub power: Option<f32>,
    /// Ah
    pub capacity_remaining: Option<f32>,
    /// Ah
    pub capacity_installed: Option<f32>,
    pub cycles: Option<u32>,
    /// Ah
    pub total_ah_drawn: Option<f32>,
    /// °C
    pub temperature: Option<f32>,
    pub min_temperature: Option<f32>,
    pub max_temperature: Option<f32>,
    pub min_cell_voltage: Option<f32>,
    pub min_cell_id: Option<String>,
    pub max_cell_voltage: Option<f32>,
    pub max_cell_id: Option<String>,
    pub cell_voltages: Vec<Option<f32>>,
    pub balancing: Option<bool>,
    pub allow_to_charge: Option<bool>,
    pub allow_to_discharge: Option<bool>,
    pub modules_blocking_charge: Option<u8>,
    pub modules_blocking_discharge: Option<u8>,
    /// A
    pub max_charge_current: Option<f32>,
    /// A
    pub max_discharge_current: Option<f32>,
    pub alarms: Protection,
    pub hardware_version: Option<String>,
    pub software_version: Option<String>,
    pub freshness: Freshness,
}

/// A direction is allowed when both the FET and the controller allow it.
/// A controller veto is known even while the FET state is not.
fn combine(fet: Option<bool>, allowed: Option<bool>) -> Option<bool> {
    match (fet, allowed) {
        (_, Some(false)) => Some(false),
        (Some(fet), Some(true)) => Some(fet),
        _ => None,
    }
}

impl Snapshot {
    /// Captures `state`. Updates older than `max_age` are reported as stale.
    pub fn new(state: &BatteryState, max_age: Duration) -> Self {
        let control = state.control.as_ref();
        let allow_to_charge = combine(state.charge_fet, control.map(|c| c.allow_charge));
        let allow_to_discharge =
            combine(state.discharge_fet, control.map(|c| c.allow_discharge));
        let min_cell = state.min_cell();
        let max_cell = state.max_cell();
        Self {
            soc: state.soc,
            voltage: state.voltage,
            current: state.current,
            power: state.power(),
            capacity_remaining: state.capacity_remaining_ah,
            capacity_installed: state.capacity_ah,
            cycles: state.cycles,
            total_ah_drawn: state.total_ah_drawn,
            temperature: state.temperature(),
            min_temperature: state.min_temperature(),
            max_temperature: state.max_temperature(),
            min_cell_voltage: min_cell.map(|(_, v)| v),
            min_cell_id: min_cell.map(|(i, _)| BatteryState::cell_description(i)),
            max_cell_voltage: max_cell.map(|(_, v)| v),
            max_cell_id: max_cell.map(|(i, _)| BatteryState::cell_description(i)),
            cell_voltages: state.cells.iter().map(|c| c.voltage).collect(),
            balancing: state.is_balancing(),
            allow_to_charge,
            allow_to_discharge,
            modules_blocking_charge: allow_to_charge.map(|a| u8::from(!a)),
            modules_blocking_discharge: allow_to_discharge.map(|a| u8::from(!a)),
            max_charge_current: control.map(|c| c.charge_current),
            max_discharge_current: control.map(|c| c.discharge_current),
            alarms: state.protection.clone(),
            hardware_version: state.hardware_version.clone(),
            software_version: state.software_version.clone(),
            freshness: state.freshness(max_age),
        }
    }
}
