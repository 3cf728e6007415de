//! Poll cycle: refresh the bound adapter, compute the current limits and
//! capture a [`Snapshot`].

use crate::battery::BatteryState;
use crate::config::BatteryConfig;
use crate::control;
use crate::driver::Driver;
use crate::snapshot::Snapshot;
use crate::Error;
use std::time::Duration;

pub const DEFAULT_MAX_TRANSPORT_FAILURES: u32 = 10;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10);

pub struct Gateway<D: Driver> {
    driver: D,
    state: BatteryState,
    transport_failures: u32,
    max_transport_failures: u32,
    max_age: Duration,
}

impl<D: Driver> Gateway<D> {
    /// Validates `config` and configures the bound driver.
    pub fn new(mut driver: D, config: &BatteryConfig) -> Result<Self, Error> {
        config.validate()?;
        let mut state = BatteryState::default();
        driver.configure(&mut state, config)?;
        log::info!(
            "{} configured: {} cells, {:?}Ah",
            driver.name(),
            state.cell_count,
            state.capacity_ah
        );
        Ok(Self {
            driver,
            state,
            transport_failures: 0,
            max_transport_failures: DEFAULT_MAX_TRANSPORT_FAILURES,
            max_age: DEFAULT_MAX_AGE,
        })
    }

    /// Consecutive hard transport failures tolerated before [`Gateway::poll`]
    /// gives up with [`Error::ReconnectExhausted`].
    pub fn set_max_transport_failures(&mut self, max: u32) {
        self.max_transport_failures = max;
    }

    pub fn set_max_age(&mut self, max_age: Duration) {
        self.max_age = max_age;
    }

    pub fn state(&self) -> &BatteryState {
        &self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Runs one cycle.
    ///
    /// A failed refresh is logged and the limits are computed over the last
    /// known values. Only repeated transport loss fails the cycle.
    pub fn poll(&mut self) -> Result<Snapshot, Error> {
        match self.driver.refresh(&mut self.state) {
            Ok(()) => {
                if self.transport_failures > 0 {
                    log::info!("{} recovered", self.driver.name());
                }
                self.transport_failures = 0;
            }
            Err(err) if err.is_transport_closed() => {
                self.transport_failures += 1;
                log::error!(
                    "Transport failure {} of {}: {}",
                    self.transport_failures,
                    self.max_transport_failures,
                    err
                );
                if self.transport_failures > self.max_transport_failures {
                    return Err(Error::ReconnectExhausted(self.transport_failures));
                }
            }
            Err(err) => log::warn!("Refresh failed: {err}"),
        }
        self.state.control = Some(control::compute(&self.state));
        Ok(Snapshot::new(&self.state, self.max_age))
    }
}
