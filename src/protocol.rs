//! JK BMS tag-length-value protocol.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! u16 start (0x4E57) | u16 length | u32 terminal id | u8 command | u8 source |
//! u8 transmission type | payload | u32 record number | u8 end (0x68) | u32 checksum
//! ```
//!
//! `length` counts every byte after the start word. The checksum is the sum of
//! all bytes before it modulo 2^16, stored in the low half of the last 4 bytes.
//!
//! The payload is a sequence of `tag | value` records without per-record
//! length, each tag has a fixed value width. The payload is scanned once into
//! a [`TagTable`] and fields are taken out of it by tag.

use crate::battery::{AlarmLevel, BatteryState, Protection, TemperatureSensor};
use crate::Error;
use serde::Serialize;

pub const START_WORD: u16 = 0x4E57;
pub const END_MARKER: u8 = 0x68;
pub const HEADER_LENGTH: usize = 11;
pub const TRAILER_LENGTH: usize = 9;
/// Bytes in front of the part counted by the length field
const LENGTH_FIELD_OFFSET: usize = 2;
/// Bytes at the end of the frame which are not part of the checksum
const CHECKSUM_LENGTH: usize = 4;

pub const COMMAND_READ_ALL: u8 = 0x06;
pub const SOURCE_HOST: u8 = 0x03;
pub const TRANSMISSION_REQUEST: u8 = 0x00;
pub const TRANSMISSION_RESPONSE: u8 = 0x01;

/// The current is transmitted with a 32768 bias, see [`decode_current`]
pub const CURRENT_ZERO: u16 = 32768;

/// Only the low 14 bits of the protection word carry alarms
const PROTECTION_MASK: u16 = 0x3FFF;

/// Request for the complete status, equal to
/// `encode_frame(COMMAND_READ_ALL, SOURCE_HOST, TRANSMISSION_REQUEST, &[0x00])`.
pub const STATUS_REQUEST: [u8; 21] = [
    0x4E, 0x57, 0x00, 0x13, 0x00, 0x00, 0x00, 0x00, 0x06, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x68, 0x00, 0x00, 0x01, 0x29,
];

pub mod tag {
    pub const CELL_VOLTAGES: u8 = 0x79;
    pub const MOSFET_TEMPERATURE: u8 = 0x80;
    pub const TEMPERATURE_1: u8 = 0x81;
    pub const TEMPERATURE_2: u8 = 0x82;
    pub const VOLTAGE: u8 = 0x83;
    pub const CURRENT: u8 = 0x84;
    pub const SOC: u8 = 0x85;
    pub const TEMPERATURE_SENSORS: u8 = 0x86;
    pub const CYCLES: u8 = 0x87;
    pub const CAPACITY_REMAINING: u8 = 0x89;
    pub const CELL_COUNT: u8 = 0x8A;
    pub const PROTECTION: u8 = 0x8B;
    pub const FET_STATUS: u8 = 0x8C;
    pub const TOTAL_OVERVOLTAGE: u8 = 0x8E;
    pub const TOTAL_UNDERVOLTAGE: u8 = 0x8F;
    pub const CELL_OVERVOLTAGE: u8 = 0x90;
    pub const CELL_UNDERVOLTAGE: u8 = 0x93;
    pub const CELL_VOLTAGE_DIFFERENCE: u8 = 0x96;
    pub const DISCHARGE_OVERCURRENT: u8 = 0x97;
    pub const CHARGE_OVERCURRENT: u8 = 0x99;
    pub const BALANCE_START_VOLTAGE: u8 = 0x9B;
    pub const ACTIVE_BALANCE: u8 = 0x9D;
    pub const CELL_COUNT_SETTING: u8 = 0xA9;
    pub const CAPACITY_SETTING: u8 = 0xAA;
    pub const CHARGE_MOSFET_SWITCH: u8 = 0xAB;
    pub const DISCHARGE_MOSFET_SWITCH: u8 = 0xAC;
    pub const DEVICE_ID: u8 = 0xB4;
    pub const MANUFACTURE_DATE: u8 = 0xB5;
    pub const WORKING_MINUTES: u8 = 0xB6;
    pub const SOFTWARE_VERSION: u8 = 0xB7;
    pub const MANUFACTURER: u8 = 0xBA;
    pub const PROTOCOL_VERSION: u8 = 0xC0;
}

/// Value width of every fixed size tag.
fn tag_width(tag: u8) -> Option<usize> {
    match tag {
        0x80..=0x84 => Some(2),
        0x85 | 0x86 => Some(1),
        0x87 => Some(2),
        0x89 => Some(4),
        0x8A..=0x8C => Some(2),
        0x8E..=0x9C => Some(2),
        0x9D => Some(1),
        0x9E..=0xA8 => Some(2),
        0xA9 => Some(1),
        0xAA => Some(4),
        0xAB | 0xAC => Some(1),
        0xAD => Some(2),
        0xAE | 0xAF => Some(1),
        0xB0 => Some(2),
        0xB1 => Some(1),
        0xB2 => Some(10),
        0xB3 => Some(1),
        0xB4 => Some(8),
        0xB5 | 0xB6 => Some(4),
        0xB7 => Some(15),
        0xB8 => Some(1),
        0xB9 => Some(4),
        0xBA => Some(24),
        0xBB..=0xBD => Some(1),
        0xBE | 0xBF => Some(2),
        0xC0 => Some(1),
        _ => None,
    }
}

macro_rules! read_bit {
    ($word:expr,$position:expr) => {
        ($word >> $position) & 1 != 0
    };
}

fn validate_len(buffer: &[u8], size: usize) -> Result<(), Error> {
    if buffer.len() < size {
        log::warn!(
            "Invalid header size - required={} received={}",
            size,
            buffer.len()
        );
        return Err(Error::ShortHeader {
            expected: size,
            received: buffer.len(),
        });
    }
    Ok(())
}

fn sum16(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

/// Checksum over all bytes except the trailing 4 checksum bytes.
pub fn calc_checksum(frame: &[u8]) -> u16 {
    sum16(&frame[..frame.len().saturating_sub(CHECKSUM_LENGTH)])
}

/// Builds a complete frame around `payload`.
pub fn encode_frame(command: u8, source: u8, transmission_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = HEADER_LENGTH - LENGTH_FIELD_OFFSET + payload.len() + TRAILER_LENGTH;
    let mut frame = Vec::with_capacity(length + LENGTH_FIELD_OFFSET);
    frame.extend_from_slice(&START_WORD.to_be_bytes());
    frame.extend_from_slice(&(length as u16).to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.push(command);
    frame.push(source);
    frame.push(transmission_type);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.push(END_MARKER);
    let checksum = sum16(&frame);
    frame.extend_from_slice(&u32::from(checksum).to_be_bytes());
    frame
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub length: u16,
    pub terminal_id: u32,
    pub command: u8,
    pub source: u8,
    pub transmission_type: u8,
}

impl Header {
    /// Decodes the fixed size header and checks the start word.
    pub fn decode(buffer: &[u8]) -> Result<Self, Error> {
        validate_len(buffer, HEADER_LENGTH)?;
        let start = u16::from_be_bytes([buffer[0], buffer[1]]);
        if start != START_WORD {
            log::warn!("Invalid start word {start:#06X}");
            return Err(Error::BadMagic {
                expected: START_WORD,
                received: start,
            });
        }
        Ok(Self {
            length: u16::from_be_bytes([buffer[2], buffer[3]]),
            terminal_id: u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            command: buffer[8],
            source: buffer[9],
            transmission_type: buffer[10],
        })
    }

    pub fn frame_size(&self) -> usize {
        usize::from(self.length) + LENGTH_FIELD_OFFSET
    }

    /// Number of bytes following the header: payload and trailer.
    pub fn body_size(&self) -> Result<usize, Error> {
        match self.frame_size().checked_sub(HEADER_LENGTH) {
            Some(size) if size >= TRAILER_LENGTH => Ok(size),
            size => Err(Error::ShortBody {
                expected: TRAILER_LENGTH,
                received: size.unwrap_or_default(),
            }),
        }
    }
}

/// Validates framing, end marker, checksum and reply code of a complete frame.
pub fn validate_frame(frame: &[u8]) -> Result<Header, Error> {
    let header = Header::decode(frame)?;
    let body_size = header.body_size()?;
    if frame.len() != header.frame_size() {
        log::warn!(
            "Invalid frame size - announced={} received={}",
            header.frame_size(),
            frame.len()
        );
        let received = frame.len().saturating_sub(HEADER_LENGTH);
        return Err(if received > body_size {
            Error::LongBody {
                expected: body_size,
                received,
            }
        } else {
            Error::ShortBody {
                expected: body_size,
                received,
            }
        });
    }
    let end = frame[frame.len() - CHECKSUM_LENGTH - 1];
    if end != END_MARKER {
        log::warn!("Invalid end marker {end:#04X}");
        return Err(Error::BadMagic {
            expected: u16::from(END_MARKER),
            received: u16::from(end),
        });
    }
    let calculated = calc_checksum(frame);
    let received = u16::from_be_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:04X?} received={:04X?} buffer={:02X?}",
            calculated,
            received,
            frame
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    if header.command != COMMAND_READ_ALL || header.transmission_type != TRANSMISSION_RESPONSE {
        return Err(Error::UnexpectedReply {
            command: header.command,
            transmission_type: header.transmission_type,
        });
    }
    Ok(header)
}

/// Payload of a frame which passed [`validate_frame`].
pub fn payload(frame: &[u8]) -> &[u8] {
    &frame[HEADER_LENGTH..frame.len() - TRAILER_LENGTH]
}

/// Tag to value table built from a single scan over the payload.
///
/// Taking a tag removes it, the remaining tags keep their payload order.
#[derive(Debug, Clone, Default)]
pub struct TagTable<'a> {
    entries: Vec<(u8, &'a [u8])>,
}

impl<'a> TagTable<'a> {
    /// Scans `payload` up to the first truncated tag.
    ///
    /// Bytes which do not start a known tag are skipped one at a time until
    /// the next known tag.
    pub fn scan(payload: &'a [u8]) -> Self {
        let mut entries = Vec::new();
        let mut skipped = 0;
        let mut pos = 0;
        while pos < payload.len() {
            let tag = payload[pos];
            let rest = &payload[pos + 1..];
            let width = match tag {
                tag::CELL_VOLTAGES => rest.first().map(|n| 1 + usize::from(*n)),
                _ => tag_width(tag),
            };
            let Some(width) = width else {
                if skipped == 0 {
                    log::debug!("Unknown tag {tag:#04X} at offset {pos}");
                }
                skipped += 1;
                pos += 1;
                continue;
            };
            if rest.len() < width {
                log::debug!(
                    "Truncated tag {:#04X} - width={} available={}",
                    tag,
                    width,
                    rest.len()
                );
                break;
            }
            entries.push((tag, &rest[..width]));
            pos += 1 + width;
        }
        if skipped > 0 {
            log::warn!("Skipped {skipped} payload bytes without a known tag");
        }
        Self { entries }
    }

    pub fn take(&mut self, tag: u8) -> Option<&'a [u8]> {
        let index = self.entries.iter().position(|(t, _)| *t == tag)?;
        Some(self.entries.remove(index).1)
    }

    pub fn take_u8(&mut self, tag: u8) -> Option<u8> {
        self.take(tag).map(|v| v[0])
    }

    pub fn take_u16(&mut self, tag: u8) -> Option<u16> {
        self.take(tag).map(|v| u16::from_be_bytes([v[0], v[1]]))
    }

    pub fn take_u32(&mut self, tag: u8) -> Option<u32> {
        self.take(tag)
            .map(|v| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    pub fn take_bool(&mut self, tag: u8) -> Option<bool> {
        self.take_u8(tag).map(|v| v != 0)
    }

    /// Takes a fixed width text field, padding is stripped.
    pub fn take_string(&mut self, tag: u8) -> Option<String> {
        self.take(tag).map(|v| {
            String::from_utf8_lossy(v)
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string()
        })
    }

    pub fn tags(&self) -> impl Iterator<Item = u8> + '_ {
        self.entries.iter().map(|(t, _)| *t)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drain(&mut self) -> Vec<(u8, Vec<u8>)> {
        self.entries
            .drain(..)
            .map(|(t, v)| (t, v.to_vec()))
            .collect()
    }
}

/// Cell voltage block: a byte count followed by `index | u16 millivolts` triples.
fn decode_cell_block(value: &[u8]) -> Vec<f32> {
    value[1..]
        .chunks_exact(3)
        .enumerate()
        .map(|(n, triple)| {
            let volt = u16::from_be_bytes([triple[1], triple[2]]) as f32 / 1000.0;
            log::trace!("Cell #{} volt={}", n + 1, volt);
            volt
        })
        .collect()
}

/// Values above 100 encode negative temperatures as `100 - raw`.
pub fn decode_temperature(raw: u16) -> f32 {
    if raw > 100 {
        100.0 - raw as f32
    } else {
        raw as f32
    }
}

/// Current in A, positive while charging. Values below the bias are discharge currents.
pub fn decode_current(raw: u16) -> f32 {
    if raw < CURRENT_ZERO {
        -(raw as f32) / 100.0
    } else {
        (raw - CURRENT_ZERO) as f32 / 100.0
    }
}

/// Maps the protection word onto the alarm fields.
///
/// Bit 7 and bit 10 both report a cell imbalance, bit 7 with the higher
/// severity. The over temperature bits (1, 4 and 8) carry no direction and
/// raise all four temperature alarms.
pub fn decode_protection(word: u16) -> Protection {
    let word = word & PROTECTION_MASK;
    let over_temperature = read_bit!(word, 1) || read_bit!(word, 4) || read_bit!(word, 8);
    Protection {
        soc_low: AlarmLevel::alarm_if(read_bit!(word, 0)),
        voltage_high: AlarmLevel::alarm_if(read_bit!(word, 2)),
        voltage_low: AlarmLevel::alarm_if(read_bit!(word, 3)),
        discharge_over_current: AlarmLevel::alarm_if(read_bit!(word, 5)),
        charge_over_current: AlarmLevel::alarm_if(read_bit!(word, 6)),
        cell_imbalance: if read_bit!(word, 7) {
            AlarmLevel::Alarm
        } else if read_bit!(word, 10) {
            AlarmLevel::Warning
        } else {
            AlarmLevel::Normal
        },
        voltage_cell_low: AlarmLevel::alarm_if(read_bit!(word, 11)),
        internal_failure: AlarmLevel::Normal,
        temp_high_charge: AlarmLevel::alarm_if(over_temperature),
        temp_low_charge: AlarmLevel::alarm_if(over_temperature),
        temp_high_discharge: AlarmLevel::alarm_if(over_temperature),
        temp_low_discharge: AlarmLevel::alarm_if(over_temperature),
    }
}

/// Configuration and identification values reported next to the telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BmsInfo {
    /// V
    pub total_overvoltage_protection: Option<f32>,
    /// V
    pub total_undervoltage_protection: Option<f32>,
    /// V
    pub cell_overvoltage_protection: Option<f32>,
    /// V
    pub cell_undervoltage_protection: Option<f32>,
    /// V
    pub cell_voltage_difference_protection: Option<f32>,
    /// A
    pub discharge_overcurrent_protection: Option<u16>,
    /// A
    pub charge_overcurrent_protection: Option<u16>,
    /// V
    pub balance_start_voltage: Option<f32>,
    pub active_balance: Option<bool>,
    pub cell_count_setting: Option<u8>,
    /// Ah
    pub capacity_setting: Option<u32>,
    pub charge_mosfet_switch: Option<bool>,
    pub discharge_mosfet_switch: Option<bool>,
    pub device_id: Option<String>,
    pub manufacture_date: Option<String>,
    pub working_minutes: Option<u32>,
    pub software_version: Option<String>,
    pub manufacturer: Option<String>,
    pub protocol_version: Option<u8>,
    /// Remaining tags in payload order
    pub other: Vec<(u8, Vec<u8>)>,
}

impl BmsInfo {
    fn take_from(tags: &mut TagTable) -> Self {
        let millivolts = |v: u16| v as f32 / 1000.0;
        let centivolts = |v: u16| v as f32 / 100.0;
        let mut info = Self {
            total_overvoltage_protection: tags.take_u16(tag::TOTAL_OVERVOLTAGE).map(centivolts),
            total_undervoltage_protection: tags
                .take_u16(tag::TOTAL_UNDERVOLTAGE)
                .map(centivolts),
            cell_overvoltage_protection: tags.take_u16(tag::CELL_OVERVOLTAGE).map(millivolts),
            cell_undervoltage_protection: tags.take_u16(tag::CELL_UNDERVOLTAGE).map(millivolts),
            cell_voltage_difference_protection: tags
                .take_u16(tag::CELL_VOLTAGE_DIFFERENCE)
                .map(millivolts),
            discharge_overcurrent_protection: tags.take_u16(tag::DISCHARGE_OVERCURRENT),
            charge_overcurrent_protection: tags.take_u16(tag::CHARGE_OVERCURRENT),
            balance_start_voltage: tags.take_u16(tag::BALANCE_START_VOLTAGE).map(millivolts),
            active_balance: tags.take_bool(tag::ACTIVE_BALANCE),
            cell_count_setting: tags.take_u8(tag::CELL_COUNT_SETTING),
            capacity_setting: tags.take_u32(tag::CAPACITY_SETTING),
            charge_mosfet_switch: tags.take_bool(tag::CHARGE_MOSFET_SWITCH),
            discharge_mosfet_switch: tags.take_bool(tag::DISCHARGE_MOSFET_SWITCH),
            device_id: tags.take_string(tag::DEVICE_ID),
            manufacture_date: tags.take_string(tag::MANUFACTURE_DATE),
            working_minutes: tags.take_u32(tag::WORKING_MINUTES),
            software_version: tags.take_string(tag::SOFTWARE_VERSION),
            manufacturer: tags.take_string(tag::MANUFACTURER),
            protocol_version: tags.take_u8(tag::PROTOCOL_VERSION),
            other: Vec::new(),
        };
        info.other = tags.drain();
        info
    }
}

/// Decoded status response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusFrame {
    pub terminal_id: u32,
    /// V, in cell order
    pub cell_voltages: Vec<f32>,
    /// °C
    pub mosfet_temperature: Option<f32>,
    /// °C
    pub temperature_1: Option<f32>,
    /// °C
    pub temperature_2: Option<f32>,
    /// V
    pub voltage: Option<f32>,
    /// A, positive while charging
    pub current: Option<f32>,
    /// %
    pub soc: Option<u8>,
    pub temperature_sensors: Option<u8>,
    pub cycles: Option<u16>,
    /// Ah
    pub capacity_remaining: Option<u32>,
    pub cell_count: Option<u16>,
    pub protection_word: Option<u16>,
    pub fet_status: Option<u16>,
    pub info: BmsInfo,
}

impl StatusFrame {
    /// Validates and decodes a complete status frame.
    ///
    /// With `expected_cells` set, a frame reporting another cell count, or
    /// carrying fewer cell voltages, fails with [`Error::CellCountMismatch`].
    pub fn decode(frame: &[u8], expected_cells: Option<usize>) -> Result<Self, Error> {
        let header = validate_frame(frame)?;
        let mut tags = TagTable::scan(payload(frame));
        log::trace!("Frame tags: {:02X?}", tags.tags().collect::<Vec<_>>());

        let cell_voltages = tags
            .take(tag::CELL_VOLTAGES)
            .map(decode_cell_block)
            .unwrap_or_default();
        let cell_count = tags.take_u16(tag::CELL_COUNT);
        if let Some(configured) = expected_cells {
            if let Some(reported) = cell_count {
                if usize::from(reported) != configured {
                    log::warn!("Cell count mismatch - configured={configured} reported={reported}");
                    return Err(Error::CellCountMismatch {
                        configured,
                        reported: usize::from(reported),
                    });
                }
            }
            if !cell_voltages.is_empty() && cell_voltages.len() < configured {
                log::warn!(
                    "Cell count mismatch - configured={configured} voltages={}",
                    cell_voltages.len()
                );
                return Err(Error::CellCountMismatch {
                    configured,
                    reported: cell_voltages.len(),
                });
            }
        }

        let frame = Self {
            terminal_id: header.terminal_id,
            cell_voltages,
            mosfet_temperature: tags.take_u16(tag::MOSFET_TEMPERATURE).map(decode_temperature),
            temperature_1: tags.take_u16(tag::TEMPERATURE_1).map(decode_temperature),
            temperature_2: tags.take_u16(tag::TEMPERATURE_2).map(decode_temperature),
            voltage: tags.take_u16(tag::VOLTAGE).map(|v| v as f32 / 100.0),
            current: tags.take_u16(tag::CURRENT).map(decode_current),
            soc: tags.take_u8(tag::SOC),
            temperature_sensors: tags.take_u8(tag::TEMPERATURE_SENSORS),
            cycles: tags.take_u16(tag::CYCLES),
            capacity_remaining: tags.take_u32(tag::CAPACITY_REMAINING),
            cell_count,
            protection_word: tags.take_u16(tag::PROTECTION),
            fet_status: tags.take_u16(tag::FET_STATUS),
            info: BmsInfo::take_from(&mut tags),
        };
        log::debug!("Decoded status frame: {frame:?}");
        Ok(frame)
    }

    pub fn protection(&self) -> Option<Protection> {
        self.protection_word.map(decode_protection)
    }

    pub fn discharge_fet(&self) -> Option<bool> {
        self.fet_status.map(|bits| read_bit!(bits, 0))
    }

    pub fn charge_fet(&self) -> Option<bool> {
        self.fet_status.map(|bits| read_bit!(bits, 1))
    }

    /// Fields which decoded but lie outside their physical range.
    pub fn anomalies(&self) -> Vec<Error> {
        let mut result = Vec::new();
        if let Some(soc) = self.soc.filter(|soc| *soc > 100) {
            result.push(Error::FieldOutOfRange {
                tag: tag::SOC,
                value: u32::from(soc),
            });
        }
        result
    }

    /// Copies every decoded field into `state`. Fields missing from the frame
    /// keep their previous value.
    pub fn apply_to(&self, state: &mut BatteryState) {
        for (cell, voltage) in state.cells.iter_mut().zip(&self.cell_voltages) {
            cell.voltage = Some(*voltage);
        }
        if let Some(t) = self.mosfet_temperature {
            state.set_temperature(TemperatureSensor::Internal, t);
        }
        if let Some(t) = self.temperature_1 {
            state.set_temperature(TemperatureSensor::Battery1, t);
        }
        if let Some(t) = self.temperature_2 {
            state.set_temperature(TemperatureSensor::Battery2, t);
        }
        if let Some(voltage) = self.voltage {
            state.voltage = Some(voltage);
        }
        if let Some(current) = self.current {
            state.current = Some(current);
        }
        if let Some(soc) = self.soc {
            state.soc = Some(f32::from(soc));
        }
        if let Some(cycles) = self.cycles {
            state.cycles = Some(u32::from(cycles));
        }
        if let Some(capacity) = self.capacity_remaining {
            state.capacity_remaining_ah = Some(capacity as f32);
        }
        if let Some(fet) = self.charge_fet() {
            state.charge_fet = Some(fet);
        }
        if let Some(fet) = self.discharge_fet() {
            state.discharge_fet = Some(fet);
        }
        if let Some(protection) = self.protection() {
            state.protection = protection;
        }
        for anomaly in self.anomalies() {
            log::warn!("{anomaly}");
        }
        state.touch();
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::config::BatteryConfig;

    #[test]
    fn status_request_is_a_valid_frame() {
        assert_eq!(
            encode_frame(COMMAND_READ_ALL, SOURCE_HOST, TRANSMISSION_REQUEST, &[0x00]),
            STATUS_REQUEST
        );
        assert_eq!(calc_checksum(&STATUS_REQUEST), 0x0129);
    }

    #[test]
    fn header_decode() {
        let frame = healthy_frame();
        let header = Header::decode(&frame).unwrap();
        assert_eq!(header.frame_size(), frame.len());
        assert_eq!(header.command, COMMAND_READ_ALL);
        assert_eq!(header.transmission_type, TRANSMISSION_RESPONSE);
        assert!(matches!(
            Header::decode(&frame[..7]),
            Err(Error::ShortHeader {
                expected: 11,
                received: 7
            })
        ));
    }

    #[test]
    fn undersized_length_is_rejected() {
        let mut frame = healthy_frame();
        frame[2] = 0;
        frame[3] = 0x0C;
        assert!(matches!(
            Header::decode(&frame).unwrap().body_size(),
            Err(Error::ShortBody { .. })
        ));
    }

    #[test]
    fn frame_size_must_match_length_field() {
        let frame = healthy_frame();
        let body_size = frame.len() - HEADER_LENGTH;

        let mut oversized = frame.clone();
        oversized.push(0x00);
        match validate_frame(&oversized) {
            Err(Error::LongBody { expected, received }) => {
                assert_eq!(expected, body_size);
                assert_eq!(received, body_size + 1);
            }
            other => panic!("unexpected result {other:?}"),
        }

        assert!(matches!(
            validate_frame(&frame[..frame.len() - 1]),
            Err(Error::ShortBody { received, .. }) if received == body_size - 1
        ));
    }

    #[test]
    fn healthy_frame_decodes() {
        let frame = StatusFrame::decode(&healthy_frame(), Some(16)).unwrap();
        assert_eq!(frame.cell_voltages, vec![3.3; 16]);
        assert_eq!(frame.voltage, Some(52.8));
        assert_eq!(frame.current, Some(5.0));
        assert_eq!(frame.soc, Some(80));
        assert_eq!(frame.cycles, Some(12));
        assert_eq!(frame.capacity_remaining, Some(224));
        assert_eq!(frame.cell_count, Some(16));
        assert_eq!(frame.mosfet_temperature, Some(31.0));
        assert_eq!(frame.protection(), Some(Protection::default()));
        assert_eq!(frame.charge_fet(), Some(true));
        assert_eq!(frame.discharge_fet(), Some(true));
        assert!(frame.anomalies().is_empty());
    }

    #[test]
    fn any_single_byte_mutation_is_rejected() {
        let frame = healthy_frame();
        for i in 0..frame.len() - 4 {
            for delta in [0x01u8, 0x80, 0xFF] {
                let mut mutated = frame.clone();
                mutated[i] = mutated[i].wrapping_add(delta);
                assert!(
                    StatusFrame::decode(&mutated, Some(16)).is_err(),
                    "mutation of byte {i} by {delta:#04X} accepted"
                );
            }
        }
    }

    #[test]
    fn wrong_reply_is_rejected() {
        let payload = healthy(&[3300; 16]).build();
        let frame = encode_frame(COMMAND_READ_ALL, 0x00, TRANSMISSION_REQUEST, &payload);
        assert!(matches!(
            StatusFrame::decode(&frame, None),
            Err(Error::UnexpectedReply {
                command: COMMAND_READ_ALL,
                transmission_type: 0
            })
        ));
        let frame = encode_frame(0x02, 0x00, TRANSMISSION_RESPONSE, &payload);
        assert!(matches!(
            StatusFrame::decode(&frame, None),
            Err(Error::UnexpectedReply { command: 0x02, .. })
        ));
    }

    #[test]
    fn bad_end_marker_is_rejected() {
        let mut frame = healthy_frame();
        let end = frame.len() - 5;
        frame[end] = 0x69;
        // keep the checksum consistent so the marker check is what fails
        let checksum = calc_checksum(&frame);
        let len = frame.len();
        frame[len - 2..].copy_from_slice(&checksum.to_be_bytes());
        assert!(matches!(
            validate_frame(&frame),
            Err(Error::BadMagic {
                expected: 0x68,
                received: 0x69
            })
        ));
    }

    #[test]
    fn take_removes_only_the_requested_tag() {
        let payload = PayloadBuilder::new()
            .u16(tag::VOLTAGE, 5280)
            .u8(tag::SOC, 80)
            .u16(tag::CYCLES, 3)
            .u16(tag::PROTECTION, 0x0004)
            .build();
        let mut tags = TagTable::scan(&payload);
        assert_eq!(tags.len(), 4);

        assert_eq!(tags.take_u8(tag::SOC), Some(80));
        assert_eq!(
            tags.tags().collect::<Vec<_>>(),
            vec![tag::VOLTAGE, tag::CYCLES, tag::PROTECTION]
        );
        assert_eq!(tags.take(tag::SOC), None);

        assert_eq!(tags.take_u16(tag::PROTECTION), Some(0x0004));
        assert_eq!(tags.take_u16(tag::VOLTAGE), Some(5280));
        assert_eq!(tags.tags().collect::<Vec<_>>(), vec![tag::CYCLES]);
    }

    #[test]
    fn tag_values_may_contain_tag_bytes() {
        // 0x85 is the SOC tag, here it is the low byte of the voltage value
        let payload = PayloadBuilder::new()
            .u16(tag::VOLTAGE, 0x1485)
            .u8(tag::SOC, 55)
            .build();
        let mut tags = TagTable::scan(&payload);
        assert_eq!(tags.take_u8(tag::SOC), Some(55));
        assert_eq!(tags.take_u16(tag::VOLTAGE), Some(0x1485));
    }

    #[test]
    fn unknown_bytes_are_skipped() {
        let payload = PayloadBuilder::new()
            .u8(tag::SOC, 42)
            .raw(&[0x42, 0x01, 0x02])
            .u16(tag::CYCLES, 7)
            .build();
        let mut tags = TagTable::scan(&payload);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.take_u8(tag::SOC), Some(42));
        assert_eq!(tags.take_u16(tag::CYCLES), Some(7));
    }

    #[test]
    fn tags_after_unknown_tag_are_decoded() {
        let payload = PayloadBuilder::new()
            .cells(&[3300; 4])
            .u16(tag::VOLTAGE, 1320)
            .raw(&[0x88, 0x00, 0x01])
            .u16(tag::PROTECTION, 0x0004)
            .u16(tag::FET_STATUS, 0b11)
            .build();
        let frame = StatusFrame::decode(&response(&payload), Some(4)).unwrap();
        assert_eq!(frame.voltage, Some(13.2));
        assert_eq!(frame.protection_word, Some(4));
        assert_eq!(frame.fet_status, Some(0b11));
        assert_eq!(frame.charge_fet(), Some(true));
    }

    #[test]
    fn truncated_tag_ends_scan() {
        let payload = PayloadBuilder::new()
            .u8(tag::SOC, 42)
            .raw(&[tag::CYCLES, 0x00])
            .build();
        let mut tags = TagTable::scan(&payload);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.take_u16(tag::CYCLES), None);
    }

    #[test]
    fn missing_tags_are_tolerated() {
        let payload = PayloadBuilder::new()
            .cells(&[3300; 4])
            .u8(tag::SOC, 50)
            .build();
        let frame = StatusFrame::decode(&response(&payload), Some(4)).unwrap();
        assert_eq!(frame.soc, Some(50));
        assert_eq!(frame.voltage, None);
        assert_eq!(frame.protection(), None);
    }

    #[test]
    fn cell_count_mismatch() {
        let payload = PayloadBuilder::new()
            .cells(&[3300; 16])
            .u16(tag::VOLTAGE, 5280)
            .u16(tag::CELL_COUNT, 15)
            .build();
        assert!(matches!(
            StatusFrame::decode(&response(&payload), Some(16)),
            Err(Error::CellCountMismatch {
                configured: 16,
                reported: 15
            })
        ));
        // Without a configured count the frame is accepted
        assert!(StatusFrame::decode(&response(&payload), None).is_ok());

        let short = PayloadBuilder::new().cells(&[3300; 8]).build();
        assert!(matches!(
            StatusFrame::decode(&response(&short), Some(16)),
            Err(Error::CellCountMismatch {
                configured: 16,
                reported: 8
            })
        ));
    }

    #[test]
    fn current_uses_bias() {
        assert_eq!(decode_current(CURRENT_ZERO + 500), 5.0);
        assert_eq!(decode_current(1000), -10.0);
        assert_eq!(decode_current(CURRENT_ZERO), 0.0);
    }

    #[test]
    fn temperature_fold() {
        assert_eq!(decode_temperature(25), 25.0);
        assert_eq!(decode_temperature(100), 100.0);
        assert_eq!(decode_temperature(105), -5.0);
    }

    #[test]
    fn protection_bits() {
        assert_eq!(decode_protection(0), Protection::default());
        assert_eq!(decode_protection(1 << 0).soc_low, AlarmLevel::Alarm);
        assert_eq!(decode_protection(1 << 2).voltage_high, AlarmLevel::Alarm);
        assert_eq!(decode_protection(1 << 3).voltage_low, AlarmLevel::Alarm);
        assert_eq!(
            decode_protection(1 << 5).discharge_over_current,
            AlarmLevel::Alarm
        );
        assert_eq!(
            decode_protection(1 << 6).charge_over_current,
            AlarmLevel::Alarm
        );
        assert_eq!(decode_protection(1 << 7).cell_imbalance, AlarmLevel::Alarm);
        assert_eq!(
            decode_protection(1 << 10).cell_imbalance,
            AlarmLevel::Warning
        );
        assert_eq!(
            decode_protection((1 << 7) | (1 << 10)).cell_imbalance,
            AlarmLevel::Alarm
        );
        assert_eq!(
            decode_protection(1 << 11).voltage_cell_low,
            AlarmLevel::Alarm
        );
        for bit in [1, 4, 8] {
            let protection = decode_protection(1 << bit);
            assert_eq!(protection.temp_high_charge, AlarmLevel::Alarm);
            assert_eq!(protection.temp_low_discharge, AlarmLevel::Alarm);
            assert_eq!(protection.voltage_high, AlarmLevel::Normal);
        }
        // Bits above the 14 bit field are ignored
        assert_eq!(decode_protection(0xC000), Protection::default());
    }

    #[test]
    fn fet_bits() {
        let mut frame = StatusFrame {
            fet_status: Some(0b01),
            ..Default::default()
        };
        assert_eq!(frame.discharge_fet(), Some(true));
        assert_eq!(frame.charge_fet(), Some(false));
        frame.fet_status = Some(0b10);
        assert_eq!(frame.discharge_fet(), Some(false));
        assert_eq!(frame.charge_fet(), Some(true));
    }

    #[test]
    fn soc_out_of_range_is_flagged_not_rejected() {
        let payload = PayloadBuilder::new().u8(tag::SOC, 120).build();
        let frame = StatusFrame::decode(&response(&payload), None).unwrap();
        assert_eq!(frame.soc, Some(120));
        assert!(matches!(
            frame.anomalies().as_slice(),
            [Error::FieldOutOfRange {
                tag: 0x85,
                value: 120
            }]
        ));
    }

    #[test]
    fn info_tags_are_captured() {
        let payload = PayloadBuilder::new()
            .u16(tag::CELL_OVERVOLTAGE, 3650)
            .u32(tag::CAPACITY_SETTING, 280)
            .raw(&[tag::SOFTWARE_VERSION])
            .raw(b"11.XW_S11.26___")
            .u16(0xB0, 10)
            .u8(tag::PROTOCOL_VERSION, 1)
            .build();
        let frame = StatusFrame::decode(&response(&payload), None).unwrap();
        assert_eq!(frame.info.cell_overvoltage_protection, Some(3.65));
        assert_eq!(frame.info.capacity_setting, Some(280));
        assert_eq!(
            frame.info.software_version.as_deref(),
            Some("11.XW_S11.26___")
        );
        assert_eq!(frame.info.protocol_version, Some(1));
        assert_eq!(frame.info.other, vec![(0xB0, vec![0x00, 0x0A])]);
    }

    #[test]
    fn apply_keeps_fields_missing_from_frame() {
        let mut state = BatteryState::default();
        state
            .configure(16, Some(280.0), &BatteryConfig::default())
            .unwrap();
        state.protection.cell_imbalance = AlarmLevel::Alarm;
        state.voltage = Some(50.0);

        let payload = PayloadBuilder::new()
            .cells(&[3300; 16])
            .u8(tag::SOC, 81)
            .build();
        StatusFrame::decode(&response(&payload), Some(16))
            .unwrap()
            .apply_to(&mut state);
        assert_eq!(state.soc, Some(81.0));
        assert_eq!(state.voltage, Some(50.0));
        assert_eq!(state.protection.cell_imbalance, AlarmLevel::Alarm);
        assert!(state.all_cells_known());
        assert!(state.last_update.is_some());
    }
}
