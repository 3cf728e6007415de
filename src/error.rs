/// Errors raised while talking to a BMS or deriving its state.
///
/// Frame level failures are transient: the current poll cycle fails and the
/// last known battery state is kept. Errors for which
/// [`Error::is_transport_closed`] returns `true` invalidate the transport
/// handle, the next cycle reconnects.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No byte arrived before the read timeout elapsed.
    #[error("Transport timeout")]
    TransportTimeout,
    /// The fixed size frame header was cut short.
    #[error("Short header - expected={expected} received={received}")]
    ShortHeader { expected: usize, received: usize },
    /// The payload and trailer announced by the header were cut short.
    #[error("Short body - expected={expected} received={received}")]
    ShortBody { expected: usize, received: usize },
    /// More bytes than the header announced.
    #[error("Frame too long - expected={expected} received={received}")]
    LongBody { expected: usize, received: usize },
    /// Start word or end marker do not match the protocol constants.
    #[error("Bad frame marker - expected={expected:#06X} received={received:#06X}")]
    BadMagic { expected: u16, received: u16 },
    #[error("Checksum mismatch - calculated={calculated:#06X} received={received:#06X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// The frame is valid but does not answer the request that was sent.
    #[error("Unexpected reply - command={command:#04X} transmission type={transmission_type}")]
    UnexpectedReply { command: u8, transmission_type: u8 },
    /// The BMS reports a different number of cells than configured.
    #[error("Cell count mismatch - configured={configured} reported={reported}")]
    CellCountMismatch { configured: usize, reported: usize },
    /// A decoded field lies outside its physical range. Logged, never fatal.
    #[error("Field {tag:#04X} out of range: {value}")]
    FieldOutOfRange { tag: u8, value: u32 },
    /// The underlying I/O layer failed hard, the handle must not be reused.
    #[error("Transport closed: {0}")]
    TransportClosed(#[source] std::io::Error),
    /// Opening or configuring the serial port failed.
    #[cfg(any(feature = "serialport", feature = "tokio-serial-async"))]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[cfg(feature = "mqtt")]
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("Battery has not been configured")]
    NotConfigured,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No battery connection at {0}")]
    NoBatteryFound(String),
    #[error("Transport could not be re-established after {0} attempts")]
    ReconnectExhausted(u32),
}

impl Error {
    /// Returns `true` for hard transport failures which require reconnecting.
    pub fn is_transport_closed(&self) -> bool {
        match self {
            Error::TransportClosed(_) => true,
            #[cfg(any(feature = "serialport", feature = "tokio-serial-async"))]
            Error::Serial(_) => true,
            #[cfg(feature = "mqtt")]
            Error::Mqtt(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Error::TransportTimeout
            }
            _ => Error::TransportClosed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let timeout: Error = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(matches!(timeout, Error::TransportTimeout));
        assert!(!timeout.is_transport_closed());

        let closed: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(closed.is_transport_closed());
    }

    #[test]
    fn frame_errors_are_transient() {
        assert!(!Error::ChecksumMismatch {
            calculated: 1,
            received: 2
        }
        .is_transport_closed());
        assert!(!Error::CellCountMismatch {
            configured: 16,
            reported: 8
        }
        .is_transport_closed());
    }
}
