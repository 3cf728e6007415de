#![cfg_attr(docsrs, feature(doc_cfg))]
//! # serialbattery_lib
//!
//! Reads JK BMS telemetry and derives the charge and discharge current limits
//! a battery monitor publishes to its inverter or charger.
//!
//! - [`protocol`] decodes the JK tag-length-value status frame.
//! - [`control`] turns a [`battery::BatteryState`] into current limits.
//! - [`driver`] binds one adapter per transport, [`gateway`] runs the poll cycle
//!   and hands a [`snapshot::Snapshot`] to the publisher.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `serialbattery` command-line tool.
//!
//! ### Adapter Features
//! - `serialport`: Enables the **synchronous** serial adapter using the `serialport` crate.
//! - `mqtt`: Enables the adapter for JK BMS values pushed over MQTT, using `rumqttc`.
//! - `tokio-serial-async`: Enables the **asynchronous** client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `bin-dependencies`: Enables all features required by the `serialbattery` binary executable.

/// Contains error types for the library.
mod error;
/// JK BMS frame codec and status decoding.
pub mod protocol;

pub mod battery;
pub mod config;
pub mod control;
pub mod driver;
pub mod gateway;
pub mod snapshot;

pub use error::Error;

/// Synchronous serial adapter.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Adapter for values pushed over MQTT.
#[cfg_attr(docsrs, doc(cfg(feature = "mqtt")))]
#[cfg(feature = "mqtt")]
pub mod jkbms_mqtt;

/// Asynchronous client.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
