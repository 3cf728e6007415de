//! Synchronous JK BMS client on a serial port.
//!
//! The port is opened lazily and dropped after a hard I/O failure, the next
//! request opens it again.

use crate::battery::BatteryState;
use crate::config::BatteryConfig;
use crate::driver::Driver;
use crate::protocol::*;
use crate::Error;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct JkSerial {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    serial: Option<Box<dyn serialport::SerialPort>>,
}

impl JkSerial {
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
            serial: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Read timeout for each request. Applied when the port is (re)opened.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Some(serial) = self.serial.as_mut() {
            if let Err(err) = serial.set_timeout(timeout) {
                log::warn!("Cannot set timeout on {}: {}", self.port_name, err);
            }
        }
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) {
        self.baud_rate = baud_rate;
        self.serial = None;
    }

    fn port(&mut self) -> Result<&mut dyn serialport::SerialPort, Error> {
        if self.serial.is_none() {
            let serial = serialport::new(&self.port_name, self.baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(self.timeout)
                .open()?;
            log::info!("Opened {} at {} baud", self.port_name, self.baud_rate);
            self.serial = Some(serial);
        }
        self.serial
            .as_deref_mut()
            .map(|s| s as &mut dyn serialport::SerialPort)
            .ok_or_else(|| Error::NoBatteryFound(self.port_name.clone()))
    }

    /// Opens the port if needed and drops input left from an earlier exchange.
    fn prepare(&mut self) -> Result<(), Error> {
        let result = self.port().and_then(discard_pending);
        if let Err(err) = &result {
            if err.is_transport_closed() {
                log::error!("Lost {}: {}", self.port_name, err);
                self.serial = None;
            }
        }
        result
    }

    /// Sends the status request and returns the raw response frame.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        self.prepare()?;
        exchange_or_drop(&mut self.serial, &STATUS_REQUEST)
    }

    pub fn read_status(&mut self, expected_cells: Option<usize>) -> Result<StatusFrame, Error> {
        let frame = self.read_frame()?;
        StatusFrame::decode(&frame, expected_cells)
    }
}

impl Driver for JkSerial {
    fn name(&self) -> &str {
        "JKBMS serial"
    }

    fn test_connection(&mut self) -> Result<(), Error> {
        self.read_status(None).map(|_| ())
    }

    fn configure(
        &mut self,
        state: &mut BatteryState,
        config: &BatteryConfig,
    ) -> Result<(), Error> {
        let expected = state.is_configured().then_some(state.cell_count);
        let status = self.read_status(expected)?;
        configure_from_status(&status, state, config)
    }

    fn refresh(&mut self, state: &mut BatteryState) -> Result<(), Error> {
        if !state.is_configured() {
            return Err(Error::NotConfigured);
        }
        self.prepare()?;
        refresh_state(&mut self.serial, state)
    }
}

/// Fixes cell count and capacity from a status frame, then applies its telemetry.
///
/// Configured values take precedence over the values reported by the BMS.
pub fn configure_from_status(
    status: &StatusFrame,
    state: &mut BatteryState,
    config: &BatteryConfig,
) -> Result<(), Error> {
    let cell_count = config
        .cell_count
        .or(status.cell_count.map(usize::from))
        .or(status.info.cell_count_setting.map(usize::from))
        .ok_or(Error::NotConfigured)?;
    if status.cell_voltages.len() < cell_count {
        return Err(Error::CellCountMismatch {
            configured: cell_count,
            reported: status.cell_voltages.len(),
        });
    }
    let capacity = config
        .capacity_ah
        .or(status.info.capacity_setting.map(|c| c as f32));
    state.configure(cell_count, capacity, config)?;
    state.hardware_version = Some(format!("JKBMS {cell_count} cells"));
    state.software_version = status.info.software_version.clone();
    status.apply_to(state);
    Ok(())
}

/// Drops bytes left over from an earlier, timed out exchange.
fn discard_pending(port: &mut dyn serialport::SerialPort) -> Result<(), Error> {
    let pending = port.bytes_to_read()?;
    if pending > 0 {
        log::trace!("Discarding {pending} pending bytes");
        port.clear(serialport::ClearBuffer::Input)?;
    }
    Ok(())
}

/// Writes `request` and reads one complete frame.
///
/// Nothing received within the port timeout is a [`Error::TransportTimeout`],
/// a partial header or body is reported as short.
pub fn exchange<P: Read + Write + ?Sized>(port: &mut P, request: &[u8]) -> Result<Vec<u8>, Error> {
    log::trace!("write bytes: {request:02X?}");
    port.write_all(request)?;

    let mut frame = vec![0; HEADER_LENGTH];
    let received = read_fully(port, &mut frame)?;
    if received == 0 {
        return Err(Error::TransportTimeout);
    }
    if received < HEADER_LENGTH {
        return Err(Error::ShortHeader {
            expected: HEADER_LENGTH,
            received,
        });
    }
    let body_size = Header::decode(&frame)?.body_size()?;
    frame.resize(HEADER_LENGTH + body_size, 0);
    let received = read_fully(port, &mut frame[HEADER_LENGTH..])?;
    if received < body_size {
        return Err(Error::ShortBody {
            expected: body_size,
            received,
        });
    }
    log::trace!("receive bytes: {frame:02X?}");
    Ok(frame)
}

/// Runs [`exchange`] on the handle in `slot`. A hard failure drops the handle.
fn exchange_or_drop<P: Read + Write + ?Sized>(
    slot: &mut Option<Box<P>>,
    request: &[u8],
) -> Result<Vec<u8>, Error> {
    let port = slot
        .as_deref_mut()
        .ok_or_else(|| Error::TransportClosed(ErrorKind::NotConnected.into()))?;
    let result = exchange(port, request);
    if let Err(err) = &result {
        if err.is_transport_closed() {
            log::error!("Closing transport: {err}");
            *slot = None;
        }
    }
    result
}

/// Reads one status frame from the handle in `slot` and applies it to `state`.
///
/// `state` is only changed by a frame which decoded completely.
pub fn refresh_state<P: Read + Write + ?Sized>(
    slot: &mut Option<Box<P>>,
    state: &mut BatteryState,
) -> Result<(), Error> {
    let frame = exchange_or_drop(slot, &STATUS_REQUEST)?;
    let status = StatusFrame::decode(&frame, Some(state.cell_count))?;
    status.apply_to(state);
    Ok(())
}

/// Reads until `buffer` is full or the port runs dry. Returns the bytes read.
fn read_fully<P: Read + ?Sized>(port: &mut P, buffer: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buffer.len() {
        match port.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                break
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}
