//! I/O board abstraction and the per-process board registry.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

use crate::{
    config::BoardCfg,
    drivers::command_board::CommandBoard,
    error::HardwareError,
};

/// Electrical quantity read from an input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    /// Input voltage in volts.
    Voltage,
    /// 1k RTD input resistance in ohms.
    Resistance,
    /// Dry contact state, 0 or 1.
    Digital,
}

/// A single command to an output channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputCommand {
    Triac(bool),
    Relay(bool),
    /// Analog output voltage.
    Analog(f64),
}

/// Trait for I/O board implementations.
///
/// Each call is one discrete command that can succeed, fail or hang; callers
/// go through [`Board`], which serializes commands and enforces a timeout.
///
/// # Example
///
/// ```no_run
/// use hvac_sequencer::board::{BoardIo, OutputCommand, ReadKind};
/// use hvac_sequencer::error::HardwareError;
///
/// #[derive(Debug)]
/// struct Loopback;
///
/// #[async_trait::async_trait]
/// impl BoardIo for Loopback {
///     async fn read(&self, _channel: u8, _kind: ReadKind) -> Result<f64, HardwareError> { Ok(5.0) }
///     async fn write(&self, _channel: u8, _command: OutputCommand) -> Result<(), HardwareError> { Ok(()) }
/// }
/// ```
#[async_trait]
pub trait BoardIo: Send + Sync + fmt::Debug {
    /// Reads one input channel.
    async fn read(&self, channel: u8, kind: ReadKind) -> Result<f64, HardwareError>;

    /// Writes one output channel.
    async fn write(&self, channel: u8, command: OutputCommand) -> Result<(), HardwareError>;
}

/// One physical board.
///
/// Commands from every equipment worker sharing the board are serialized by
/// the bus lock so driver invocations never interleave.
#[derive(Debug)]
pub struct Board {
    id: String,
    io: Box<dyn BoardIo>,
    bus: Mutex<()>,
    timeout: Duration,
}

impl Board {
    pub fn new(id: impl Into<String>, io: Box<dyn BoardIo>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            io,
            bus: Mutex::new(()),
            timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn read(&self, channel: u8, kind: ReadKind) -> Result<f64, HardwareError> {
        let _bus = self.bus.lock().await;
        tokio::time::timeout(self.timeout, self.io.read(channel, kind))
            .await
            .map_err(|_| HardwareError::Timeout(self.timeout))?
    }

    pub async fn write(&self, channel: u8, command: OutputCommand) -> Result<(), HardwareError> {
        let _bus = self.bus.lock().await;
        tokio::time::timeout(self.timeout, self.io.write(channel, command))
            .await
            .map_err(|_| HardwareError::Timeout(self.timeout))?
    }
}

/// Registry of every board, built once at startup and shared by handle.
#[derive(Debug, Clone, Default)]
pub struct Boards(Arc<HashMap<String, Arc<Board>>>);

impl Boards {
    pub fn from_config(cfg: &[BoardCfg]) -> Self {
        Self::with_boards(cfg.iter().map(|board| match board {
            BoardCfg::Command {
                id,
                program,
                stack,
                verbs,
                timeout_ms,
            } => {
                info!("Registering board '{id}' ({program} stack {stack})");
                Board::new(
                    id.clone(),
                    Box::new(CommandBoard::new(program.clone(), *stack, verbs.clone())),
                    Duration::from_millis(*timeout_ms),
                )
            }
        }))
    }

    pub fn with_boards(boards: impl IntoIterator<Item = Board>) -> Self {
        Self(Arc::new(
            boards
                .into_iter()
                .map(|board| (board.id.clone(), Arc::new(board)))
                .collect(),
        ))
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Board>> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
