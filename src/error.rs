//! Error taxonomy for the control engine.
//!
//! Each error type maps to one failure class with its own propagation policy:
//! acquisition falls back to last-known-good, protocol errors surface to the
//! caller, write errors leave output state untouched for a retry, config errors
//! skip one equipment instance and probe errors count toward failover.

use std::time::Duration;

use thiserror::Error;

/// Raw failure of a single board command.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HardwareError {
    /// The board program ran but reported a failure.
    #[error("board command failed: {0}")]
    Command(String),

    /// The board program produced output that could not be parsed.
    #[error("unparseable board response: {0:?}")]
    Parse(String),

    /// The command did not finish within its budget.
    #[error("board command timed out after {0:?}")]
    Timeout(Duration),
}

/// A configured input channel could not be read.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("input '{input}' references unknown board '{board}'")]
    UnknownBoard { input: String, board: String },

    #[error("input '{input}' on board '{board}' channel {channel}: {source}")]
    Read {
        input: String,
        board: String,
        channel: u8,
        #[source]
        source: HardwareError,
    },

    /// The channel answered but the value is outside the sensor's span.
    #[error("input '{input}' reading {raw} is out of range (open or shorted sensor)")]
    OutOfRange { input: String, raw: f64 },
}

/// Malformed, short or missing response from a serial device.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("serial I/O failure: {0}")]
    Io(String),

    #[error("response from address {actual:#04x}, expected {expected:#04x}")]
    AddressMismatch { expected: u8, actual: u8 },

    #[error("response function {actual:#04x}, expected {expected:#04x}")]
    FunctionMismatch { expected: u8, actual: u8 },

    #[error("response too short: {actual} bytes, need {expected}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    Checksum { computed: u16, received: u16 },

    #[error("polling suspended after {0} consecutive failures")]
    Suspended(u32),
}

/// A hardware write failed; the channel's recorded state is not advanced.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WriteError {
    #[error("output '{output}' references unknown board '{board}'")]
    UnknownBoard { output: String, board: String },

    #[error("output '{output}' on board '{board}' channel {channel}: {source}")]
    Write {
        output: String,
        board: String,
        channel: u8,
        #[source]
        source: HardwareError,
    },
}

/// Missing or invalid configuration for one equipment instance.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("equipment '{0}' is not configured")]
    UnknownEquipment(String),

    #[error("equipment '{0}' has no local control strategy")]
    NoLocalStrategy(String),

    #[error("'{owner}' references unknown {what} '{name}'")]
    DanglingReference {
        owner: String,
        what: &'static str,
        name: String,
    },

    #[error("duplicate {what} id '{id}'")]
    Duplicate { what: &'static str, id: String },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// The remote authority did not answer a reachability probe.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProbeError {
    #[error("remote authority unreachable: {0}")]
    Unreachable(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

/// A delegated control request to the remote authority failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RemoteError {
    #[error("remote request failed: {0}")]
    Transport(String),

    #[error("remote response could not be decoded: {0}")]
    Decode(String),

    #[error("remote request timed out after {0:?}")]
    Timeout(Duration),
}
