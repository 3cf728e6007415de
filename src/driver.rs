//! BMS adapter capability and adapter selection.
//!
//! Every adapter implements [`Driver`]. The adapter for a transport is chosen
//! once with [`select`] and stays bound for the lifetime of the process.

use crate::battery::BatteryState;
use crate::config::BatteryConfig;
use crate::Error;
use std::time::Duration;

/// Capability shared by all BMS adapters.
pub trait Driver {
    fn name(&self) -> &str;

    /// Checks whether a BMS of this kind answers on the transport.
    fn test_connection(&mut self) -> Result<(), Error>;

    /// Fixes cell count, capacity and limits in `state`. Called once after a
    /// successful [`Driver::test_connection`].
    fn configure(&mut self, state: &mut BatteryState, config: &BatteryConfig)
        -> Result<(), Error>;

    /// Updates `state` with the newest telemetry. On error `state` keeps its
    /// previous values.
    fn refresh(&mut self, state: &mut BatteryState) -> Result<(), Error>;
}

impl<D: Driver + ?Sized> Driver for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn test_connection(&mut self) -> Result<(), Error> {
        (**self).test_connection()
    }

    fn configure(
        &mut self,
        state: &mut BatteryState,
        config: &BatteryConfig,
    ) -> Result<(), Error> {
        (**self).configure(state, config)
    }

    fn refresh(&mut self, state: &mut BatteryState) -> Result<(), Error> {
        (**self).refresh(state)
    }
}

/// How often and how fast candidates are tested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl ProbePolicy {
    /// Probing the whole candidate list
    pub const CANDIDATES: ProbePolicy = ProbePolicy {
        attempts: 3,
        backoff: Duration::from_millis(500),
    };
    /// Probing a single, explicitly chosen candidate
    pub const FORCED: ProbePolicy = ProbePolicy {
        attempts: 5,
        backoff: Duration::from_secs(1),
    };
}

/// Tests every candidate in order and returns the first one that answers.
///
/// The whole list is tried `policy.attempts` times with `policy.backoff`
/// between rounds.
pub fn probe<D: Driver>(
    port_name: &str,
    mut candidates: Vec<D>,
    policy: &ProbePolicy,
) -> Result<D, Error> {
    for attempt in 1..=policy.attempts {
        for index in 0..candidates.len() {
            match candidates[index].test_connection() {
                Ok(()) => {
                    log::info!(
                        "Found {} at {} (attempt {} of {})",
                        candidates[index].name(),
                        port_name,
                        attempt,
                        policy.attempts
                    );
                    return Ok(candidates.swap_remove(index));
                }
                Err(err) => log::debug!(
                    "{} did not answer at {}: {}",
                    candidates[index].name(),
                    port_name,
                    err
                ),
            }
        }
        if attempt < policy.attempts {
            std::thread::sleep(policy.backoff);
        }
    }
    log::error!("No battery connection at {port_name}");
    Err(Error::NoBatteryFound(port_name.to_string()))
}

/// Closed set of adapters the binary can bind.
#[cfg(any(feature = "serialport", feature = "mqtt"))]
pub enum Adapter {
    #[cfg(feature = "serialport")]
    Serial(crate::serialport::JkSerial),
    #[cfg(feature = "mqtt")]
    Mqtt(crate::jkbms_mqtt::JkMqtt),
}

#[cfg(any(feature = "serialport", feature = "mqtt"))]
macro_rules! with_adapter {
    ($adapter:expr, $driver:ident => $body:expr) => {
        match $adapter {
            #[cfg(feature = "serialport")]
            Adapter::Serial($driver) => $body,
            #[cfg(feature = "mqtt")]
            Adapter::Mqtt($driver) => $body,
        }
    };
}

#[cfg(any(feature = "serialport", feature = "mqtt"))]
impl Driver for Adapter {
    fn name(&self) -> &str {
        with_adapter!(self, driver => driver.name())
    }

    fn test_connection(&mut self) -> Result<(), Error> {
        with_adapter!(self, driver => driver.test_connection())
    }

    fn configure(
        &mut self,
        state: &mut BatteryState,
        config: &BatteryConfig,
    ) -> Result<(), Error> {
        with_adapter!(self, driver => driver.configure(state, config))
    }

    fn refresh(&mut self, state: &mut BatteryState) -> Result<(), Error> {
        with_adapter!(self, driver => driver.refresh(state))
    }
}

/// Transport names with this prefix name an MQTT subscription, not a device.
pub const MQTT_PORT_PREFIX: &str = "jkbms";

/// Returns `true` if `port_name` is bound to the MQTT adapter without probing.
pub fn is_mqtt_port(port_name: &str) -> bool {
    port_name.starts_with(MQTT_PORT_PREFIX)
}

/// Adapters which may serve `port_name`, in probing order.
#[cfg(feature = "serialport")]
pub fn candidates(port_name: &str, timeout: Duration) -> Vec<Adapter> {
    let mut serial = crate::serialport::JkSerial::new(port_name);
    serial.set_timeout(timeout);
    vec![Adapter::Serial(serial)]
}

/// Binds the adapter for `port_name`.
///
/// MQTT transport names bypass probing. With `forced` set only that
/// candidate is probed, with [`ProbePolicy::FORCED`].
#[cfg(any(feature = "serialport", feature = "mqtt"))]
pub fn select(
    port_name: &str,
    timeout: Duration,
    config: &BatteryConfig,
    forced: Option<usize>,
) -> Result<Adapter, Error> {
    if is_mqtt_port(port_name) {
        #[cfg(feature = "mqtt")]
        {
            log::info!("Binding MQTT adapter for {port_name}");
            return Ok(Adapter::Mqtt(crate::jkbms_mqtt::JkMqtt::connect(
                &config.mqtt,
            )?));
        }
        #[cfg(not(feature = "mqtt"))]
        return Err(Error::InvalidConfig(format!(
            "{port_name} requires the mqtt feature"
        )));
    }

    #[cfg(feature = "serialport")]
    {
        let _ = config;
        let mut candidates = candidates(port_name, timeout);
        match forced {
            Some(index) if index >= candidates.len() => Err(Error::InvalidConfig(format!(
                "driver index {} out of range, {} candidates available",
                index,
                candidates.len()
            ))),
            Some(index) => {
                let candidate = candidates.swap_remove(index);
                probe(port_name, vec![candidate], &ProbePolicy::FORCED)
            }
            None => probe(port_name, candidates, &ProbePolicy::CANDIDATES),
        }
    }
    #[cfg(not(feature = "serialport"))]
    {
        let _ = (timeout, forced);
        Err(Error::InvalidConfig(format!(
            "{port_name} requires the serialport feature"
        )))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Driver which replays scripted results.
    pub struct MockDriver {
        pub name: String,
        pub connection: VecDeque<Result<(), Error>>,
        pub refreshes: VecDeque<Result<Box<dyn Fn(&mut BatteryState)>, Error>>,
        pub test_calls: usize,
    }

    impl MockDriver {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                connection: VecDeque::new(),
                refreshes: VecDeque::new(),
                test_calls: 0,
            }
        }
    }

    impl Driver for MockDriver {
        fn name(&self) -> &str {
            &self.name
        }

        fn test_connection(&mut self) -> Result<(), Error> {
            self.test_calls += 1;
            self.connection
                .pop_front()
                .unwrap_or(Err(Error::TransportTimeout))
        }

        fn configure(
            &mut self,
            state: &mut BatteryState,
            config: &BatteryConfig,
        ) -> Result<(), Error> {
            state.configure(config.cell_count.unwrap_or(16), Some(280.0), config)
        }

        fn refresh(&mut self, state: &mut BatteryState) -> Result<(), Error> {
            let update = self
                .refreshes
                .pop_front()
                .unwrap_or(Err(Error::TransportTimeout))?;
            update(state);
            state.touch();
            Ok(())
        }
    }
}
