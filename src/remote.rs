//! Client side of the remote supervisory authority.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::{Instant, timeout},
};

use crate::{
    acquisition::Readings,
    config::FailoverCfg,
    error::{ProbeError, RemoteError},
    strategy::DesiredOutputs,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Reachability check; returns the round-trip time.
    async fn probe(&self) -> Result<Duration, ProbeError>;

    /// Asks the remote side for one equipment's outputs.
    async fn request_outputs(
        &self,
        equipment_id: &str,
        inputs: &Readings,
    ) -> Result<DesiredOutputs, RemoteError>;
}

#[derive(Serialize)]
struct OutputRequest<'a> {
    equipment_id: &'a str,
    inputs: &'a Readings,
}

/// Line-delimited JSON over TCP. A probe is a bare connect.
#[derive(Debug, Clone)]
pub struct TcpAuthority {
    address: String,
    timeout: Duration,
}

impl TcpAuthority {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &FailoverCfg) -> Self {
        Self::new(cfg.address.clone(), Duration::from_millis(cfg.timeout_ms))
    }

    async fn exchange(&self, line: Vec<u8>) -> Result<DesiredOutputs, RemoteError> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| RemoteError::Transport(format!("connect {}: {e}", self.address)))?;
        stream
            .write_all(&line)
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let mut reply = String::new();
        let read = BufReader::new(stream)
            .read_line(&mut reply)
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if read == 0 {
            return Err(RemoteError::Transport("connection closed without reply".into()));
        }
        serde_json::from_str(reply.trim_end())
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteAuthority for TcpAuthority {
    async fn probe(&self) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        match timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(ProbeError::Unreachable(format!("{}: {e}", self.address))),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }

    async fn request_outputs(
        &self,
        equipment_id: &str,
        inputs: &Readings,
    ) -> Result<DesiredOutputs, RemoteError> {
        let mut line = serde_json::to_vec(&OutputRequest {
            equipment_id,
            inputs,
        })
        .map_err(|e| RemoteError::Decode(e.to_string()))?;
        line.push(b'\n');

        timeout(self.timeout, self.exchange(line))
            .await
            .map_err(|_| RemoteError::Timeout(self.timeout))?
    }
}
