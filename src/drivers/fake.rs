//! Recording board used by tests to observe write ordering and timing.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    board::{Board, BoardIo, OutputCommand, ReadKind},
    error::HardwareError,
};

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub board: String,
    pub channel: u8,
    pub command: OutputCommand,
    pub at: Instant,
}

/// Write log shared by every fake board of a test.
#[derive(Debug, Clone, Default)]
pub struct WriteLog(Arc<Mutex<Vec<WriteRecord>>>);

impl WriteLog {
    pub fn records(&self) -> Vec<WriteRecord> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    /// Index of the first write matching `channel` and `command`.
    pub fn position(&self, channel: u8, command: OutputCommand) -> Option<usize> {
        self.records()
            .iter()
            .position(|r| r.channel == channel && r.command == command)
    }

    pub fn find(&self, channel: u8, command: OutputCommand) -> Option<WriteRecord> {
        self.records()
            .into_iter()
            .find(|r| r.channel == channel && r.command == command)
    }
}

#[derive(Debug, Clone)]
pub struct RecordingBoard {
    id: String,
    log: WriteLog,
    inputs: Arc<Mutex<HashMap<(u8, ReadKind), f64>>>,
    failing_reads: Arc<Mutex<HashSet<u8>>>,
    failing_writes: Arc<Mutex<HashSet<u8>>>,
}

impl RecordingBoard {
    pub fn new(id: &str) -> Self {
        Self::with_log(id, WriteLog::default())
    }

    pub fn with_log(id: &str, log: WriteLog) -> Self {
        Self {
            id: id.to_string(),
            log,
            inputs: Arc::default(),
            failing_reads: Arc::default(),
            failing_writes: Arc::default(),
        }
    }

    pub fn log(&self) -> WriteLog {
        self.log.clone()
    }

    pub fn set_input(&self, channel: u8, kind: ReadKind, value: f64) {
        self.inputs.lock().unwrap().insert((channel, kind), value);
    }

    pub fn fail_reads(&self, channel: u8, failing: bool) {
        toggle(&self.failing_reads, channel, failing);
    }

    pub fn fail_writes(&self, channel: u8, failing: bool) {
        toggle(&self.failing_writes, channel, failing);
    }

    pub fn into_board(self) -> Board {
        let id = self.id.clone();
        Board::new(id, Box::new(self), Duration::from_secs(2))
    }
}

fn toggle(set: &Mutex<HashSet<u8>>, channel: u8, on: bool) {
    let mut set = set.lock().unwrap();
    if on {
        set.insert(channel);
    } else {
        set.remove(&channel);
    }
}

#[async_trait]
impl BoardIo for RecordingBoard {
    async fn read(&self, channel: u8, kind: ReadKind) -> Result<f64, HardwareError> {
        if self.failing_reads.lock().unwrap().contains(&channel) {
            return Err(HardwareError::Command(format!("read channel {channel} failed")));
        }
        self.inputs
            .lock()
            .unwrap()
            .get(&(channel, kind))
            .copied()
            .ok_or_else(|| HardwareError::Parse(format!("no value for channel {channel}")))
    }

    async fn write(&self, channel: u8, command: OutputCommand) -> Result<(), HardwareError> {
        if self.failing_writes.lock().unwrap().contains(&channel) {
            return Err(HardwareError::Command(format!("write channel {channel} failed")));
        }
        self.log.0.lock().unwrap().push(WriteRecord {
            board: self.id.clone(),
            channel,
            command,
            at: Instant::now(),
        });
        Ok(())
    }
}
