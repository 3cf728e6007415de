//! Charge and discharge current limits.
//!
//! The limits are a pure function of the current [`BatteryState`] and its
//! [`Limits`](crate::battery::Limits). Missing telemetry never loosens a limit:
//! without SOC, pack voltage and every cell voltage the output is
//! [`ControlOutput::FAIL_SAFE`].

use crate::battery::BatteryState;
use crate::config::TemperatureDerating;
use serde::Serialize;

/// SOC range in % over which the charge current ramps down to zero
const CHARGE_SOC_RAMP: (f32, f32) = (95.0, 100.0);
/// SOC range in % over which the discharge current ramps down to zero
const DISCHARGE_SOC_RAMP: (f32, f32) = (20.0, 10.0);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlOutput {
    /// A
    pub charge_current: f32,
    /// A
    pub discharge_current: f32,
    pub allow_charge: bool,
    pub allow_discharge: bool,
}

impl ControlOutput {
    pub const FAIL_SAFE: ControlOutput = ControlOutput {
        charge_current: 1.0,
        discharge_current: 1.0,
        allow_charge: false,
        allow_discharge: false,
    };
}

/// Ramp from 1.0 at `threshold` down to 0.0 at `max_value`.
///
/// Below `threshold` the result is 1.0, at or past `max_value` it is 0.0.
pub fn linear(value: f32, threshold: f32, max_value: f32) -> f32 {
    if value < threshold {
        return 1.0;
    }
    let span = max_value - threshold;
    if span == 0.0 {
        return 0.0;
    }
    (1.0 - (value - threshold) / span).max(0.0)
}

/// Full `current` above the warning temperature, none at the cutoff.
pub fn charge_temperature_curve(current: f32, temperature: f32, derating: &TemperatureDerating) -> f32 {
    current * linear(-temperature, -derating.warn, -derating.cutoff)
}

pub fn discharge_temperature_curve(
    current: f32,
    temperature: f32,
    derating: &TemperatureDerating,
) -> f32 {
    current * linear(-temperature, -derating.warn, -derating.cutoff)
}

/// Computes the current limits for `state`.
pub fn compute(state: &BatteryState) -> ControlOutput {
    let (Some(soc), Some(voltage), Some(min_cell), Some(max_cell)) = (
        state.soc.filter(|v| v.is_finite()),
        state.voltage.filter(|v| v.is_finite()),
        state.min_cell_voltage(),
        state.max_cell_voltage(),
    ) else {
        log::info!("Telemetry incomplete, using fail-safe limits");
        return ControlOutput::FAIL_SAFE;
    };
    if !state.all_cells_known()
        || state
            .cells
            .iter()
            .any(|c| c.voltage.is_some_and(|v| !v.is_finite()))
    {
        log::info!("Cell voltages incomplete, using fail-safe limits");
        return ControlOutput::FAIL_SAFE;
    }

    let limits = &state.limits;
    let cells = state.cell_count as f32;

    let charge_cell = linear(
        max_cell,
        limits.max_battery_voltage_warning / cells,
        limits.max_battery_voltage / cells,
    );
    let charge_pack = linear(
        voltage,
        limits.max_battery_voltage_warning,
        limits.max_battery_voltage,
    );
    let charge_soc = linear(soc, CHARGE_SOC_RAMP.0, CHARGE_SOC_RAMP.1);
    let mut charge_current =
        charge_cell.min(charge_pack.max(charge_soc)) * limits.max_charge_current;

    let discharge_cell = linear(
        -min_cell,
        -limits.min_battery_voltage_warning / cells,
        -limits.min_battery_voltage / cells,
    );
    let discharge_pack = linear(
        -voltage,
        -limits.min_battery_voltage_warning,
        -limits.min_battery_voltage,
    );
    let discharge_soc = linear(-soc, -DISCHARGE_SOC_RAMP.0, -DISCHARGE_SOC_RAMP.1);
    let mut discharge_current =
        discharge_cell.min(discharge_pack.max(discharge_soc)) * limits.max_discharge_current;

    if let Some(derating) = &limits.temperature_derating {
        match state.min_temperature() {
            Some(coldest) => {
                charge_current = charge_temperature_curve(charge_current, coldest, derating);
                discharge_current = discharge_temperature_curve(discharge_current, coldest, derating);
            }
            None => {
                log::info!("Temperature derating enabled without a known temperature");
                charge_current = 0.0;
                discharge_current = 0.0;
            }
        }
    }

    let output = ControlOutput {
        charge_current: charge_current.floor(),
        discharge_current: discharge_current.floor(),
        allow_charge: max_cell < limits.max_battery_voltage / cells,
        allow_discharge: min_cell > limits.min_battery_voltage / cells,
    };
    log::info!(
        "soc={soc}% voltage={voltage:.2}V cells={min_cell:.3}V-{max_cell:.3}V \
         charge(cell={charge_cell:.2} pack={charge_pack:.2} soc={charge_soc:.2}) \
         discharge(cell={discharge_cell:.2} pack={discharge_pack:.2} soc={discharge_soc:.2}) -> {output:?}"
    );
    output
}
