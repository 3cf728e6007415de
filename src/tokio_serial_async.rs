//! Asynchronous JK BMS client on Tokio.
//!
//! Works on any `AsyncRead + AsyncWrite` stream, a serial port opened with
//! [`JkBms::new`] or e.g. a TCP bridge passed to [`JkBms::from_stream`].
//!
//! # Example
//!
//! ```no_run
//! use serialbattery_lib::tokio_serial_async::JkBms;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), serialbattery_lib::Error> {
//!     let mut bms = JkBms::new("/dev/ttyUSB0")?;
//!     bms.set_timeout(Duration::from_millis(500));
//!
//!     let status = bms.get_status(None).await?;
//!     println!("SOC: {:?}%, cells: {:?}", status.soc, status.cell_voltages);
//!     Ok(())
//! }
//! ```

use crate::protocol::*;
use crate::Error;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug)]
pub struct JkBms<S> {
    serial: S,
    io_timeout: Duration, // Timeout for individual I/O operations
    retries: u8,
}

impl JkBms<tokio_serial::SerialStream> {
    /// Opens `port` at 115200 baud, 8N1.
    pub fn new(port: &str) -> Result<Self, Error> {
        let serial = tokio_serial::new(port, DEFAULT_BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        Ok(Self::from_stream(serial))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> JkBms<S> {
    pub fn from_stream(serial: S) -> Self {
        Self {
            serial,
            io_timeout: Duration::from_secs(1),
            retries: 3,
        }
    }

    /// sets the number of retries for a failed request
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    /// Reads until `buffer` is full, the stream ends or a read times out.
    async fn read_fully(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
        let mut filled = 0;
        while filled < buffer.len() {
            match tokio::time::timeout(self.io_timeout, self.serial.read(&mut buffer[filled..]))
                .await
            {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(err)) => return Err(err.into()),
            }
        }
        Ok(filled)
    }

    /// Writes `request` and reads one complete frame.
    pub async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        log::trace!("write bytes: {request:02X?}");
        tokio::time::timeout(self.io_timeout, self.serial.write_all(request))
            .await
            .map_err(|_| Error::TransportTimeout)??;

        let mut frame = vec![0; HEADER_LENGTH];
        let received = self.read_fully(&mut frame).await?;
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
        let received = self.read_fully(&mut frame[HEADER_LENGTH..]).await?;
        if received < body_size {
            return Err(Error::ShortBody {
                expected: body_size,
                received,
            });
        }
        log::trace!("receive bytes: {frame:02X?}");
        Ok(frame)
    }

    async fn request_status(&mut self, expected_cells: Option<usize>) -> Result<StatusFrame, Error> {
        let frame = self.exchange(&STATUS_REQUEST).await?;
        StatusFrame::decode(&frame, expected_cells)
    }

    /// Requests and decodes the status frame, retrying transient failures.
    pub async fn get_status(&mut self, expected_cells: Option<usize>) -> Result<StatusFrame, Error> {
        log::trace!("get status");
        for t in 0..self.retries {
            match self.request_status(expected_cells).await {
                Ok(status) => return Ok(status),
                Err(err) if err.is_transport_closed() => return Err(err),
                Err(err) => {
                    log::trace!("Failed try {} of {}, repeating ({err})", t + 1, self.retries)
                }
            }
        }
        self.request_status(expected_cells).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fixtures::*;

    #[tokio::test]
    async fn status_over_stream() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(&healthy_frame()).await.unwrap();

        let mut bms = JkBms::from_stream(client);
        let status = bms.get_status(Some(16)).await.unwrap();
        assert_eq!(status.soc, Some(80));
        assert_eq!(status.cell_voltages.len(), 16);

        let mut request = [0u8; 21];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(request, STATUS_REQUEST);
    }

    #[tokio::test]
    async fn retries_after_corrupted_frame() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut corrupted = healthy_frame();
        let len = corrupted.len();
        corrupted[len - 1] ^= 0xFF;
        server.write_all(&corrupted).await.unwrap();
        server.write_all(&healthy_frame()).await.unwrap();

        let mut bms = JkBms::from_stream(client);
        bms.set_retry(1);
        let status = bms.get_status(None).await.unwrap();
        assert_eq!(status.voltage, Some(52.8));
    }

    #[tokio::test]
    async fn silent_stream_times_out() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut bms = JkBms::from_stream(client);
        bms.set_timeout(Duration::from_millis(10));
        bms.set_retry(0);
        assert!(matches!(
            bms.get_status(None).await,
            Err(Error::TransportTimeout)
        ));
    }
}
