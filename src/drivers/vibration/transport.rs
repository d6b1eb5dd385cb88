//! Serial byte transport for the vibration sensor.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::Instant,
};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

use crate::error::ProtocolError;

/// One request/response exchange over a serial link.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SerialTransport: Send + Sync {
    /// Sends `request` and collects up to `expected_len` response bytes.
    ///
    /// Returns whatever arrived before `timeout` if at least one byte did;
    /// frame validation is left to the caller.
    async fn exchange(
        &self,
        request: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError>;
}

/// Serial port opened for each exchange and closed when it returns.
#[derive(Debug, Clone)]
pub struct SerialPortTransport {
    path: String,
    baud: u32,
}

impl SerialPortTransport {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
        }
    }
}

#[async_trait]
impl SerialTransport for SerialPortTransport {
    async fn exchange(
        &self,
        request: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut port = tokio_serial::new(&self.path, self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| ProtocolError::Io(format!("open {}: {e}", self.path)))?;

        port.write_all(request)
            .await
            .map_err(|e| ProtocolError::Io(format!("write {}: {e}", self.path)))?;

        let deadline = Instant::now() + timeout;
        let mut response = Vec::with_capacity(expected_len);
        let mut chunk = [0u8; 64];
        while response.len() < expected_len {
            match tokio::time::timeout_at(deadline, port.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => response.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    return Err(ProtocolError::Io(format!("read {}: {e}", self.path)));
                }
            }
        }

        #[cfg(debug_assertions)]
        log::debug!("{}: {} of {expected_len} bytes", self.path, response.len());

        if response.is_empty() {
            Err(ProtocolError::Timeout(timeout))
        } else {
            Ok(response)
        }
    }
}
