//! Serial APT transport over a USB virtual COM port.

use crate::error::{AptResult, ScanError};
use crate::protocol;
use crate::transport::AptTransport;
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Maximum time to wait for a complete response frame.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// APT transport over a `tokio_serial` stream.
///
/// The T-cube USB bridge presents a plain virtual COM port; framing is the
/// 6-byte APT header described in [`crate::protocol`]. One transport owns
/// one port, so no locking is needed beyond `&mut self`.
pub struct SerialTransport {
    port: SerialStream,
    port_path: String,
}

impl SerialTransport {
    /// Open the serial port at `port_path`.
    ///
    /// Settings are 8 data bits, no parity, one stop bit, no flow control.
    pub fn open(port_path: &str, baud_rate: u32) -> AptResult<Self> {
        let port = tokio_serial::new(port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                ScanError::Transport(format!("failed to open serial port {port_path}: {e}"))
            })?;

        debug!("opened serial port {} at {} baud", port_path, baud_rate);

        Ok(Self {
            port,
            port_path: port_path.to_string(),
        })
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> AptResult<()> {
        self.port.write_all(bytes).await.map_err(|e| {
            ScanError::Transport(format!("write to {} failed: {e}", self.port_path))
        })
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> AptResult<()> {
        match tokio::time::timeout(RESPONSE_TIMEOUT, self.port.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ScanError::Transport(format!(
                "read from {} failed: {e}",
                self.port_path
            ))),
            Err(_) => Err(ScanError::Transport(format!(
                "read from {} timed out after {:?}",
                self.port_path, RESPONSE_TIMEOUT
            ))),
        }
    }
}

#[async_trait]
impl AptTransport for SerialTransport {
    async fn write(&mut self, id: u16, value: u16) -> AptResult<()> {
        debug!("[{}] write {:#06x} value {:#06x}", self.port_path, id, value);
        self.send_bytes(&protocol::short_frame(id, value)).await
    }

    async fn write_with_data(&mut self, id: u16, data: &[u8]) -> AptResult<()> {
        debug!(
            "[{}] write {:#06x} with {} data bytes",
            self.port_path,
            id,
            data.len()
        );
        let header = protocol::data_header(id, data.len() as u16);
        let mut frame = Vec::with_capacity(6 + data.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(data);
        self.send_bytes(&frame).await
    }

    async fn query(&mut self, req_id: u16, resp_id: u16) -> AptResult<Vec<u8>> {
        self.send_bytes(&protocol::short_frame(req_id, 0x0000))
            .await?;

        // Responses arrive as a 6-byte header, optionally followed by a
        // payload whose length the header carries. Frames for other message
        // ids are drained and skipped so a late status packet cannot
        // misalign the stream.
        loop {
            let mut header = [0u8; 6];
            self.read_exact(&mut header).await?;

            let id = protocol::frame_id(&header);
            let len = protocol::frame_data_len(&header);
            let mut payload = vec![0u8; len];
            if len > 0 {
                self.read_exact(&mut payload).await?;
            }

            if id == resp_id {
                debug!(
                    "[{}] query {:#06x} returned {} payload bytes",
                    self.port_path, req_id, len
                );
                return Ok(payload);
            }
            debug!(
                "[{}] skipping unexpected frame {:#06x} while waiting for {:#06x}",
                self.port_path, id, resp_id
            );
        }
    }
}
