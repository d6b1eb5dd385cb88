//! I/O board driven through its vendor command-line program.

use async_trait::async_trait;
#[cfg(debug_assertions)]
use log::debug;
use tokio::process::Command;

use crate::{
    board::{BoardIo, OutputCommand, ReadKind},
    config::CommandVerbs,
    error::HardwareError,
};

/// Board addressed as `<program> <stack> <verb> <channel> [value]`.
///
/// # Example
///
/// ```no_run
/// use hvac_sequencer::board::{BoardIo, OutputCommand};
/// use hvac_sequencer::config::CommandVerbs;
/// use hvac_sequencer::drivers::command_board::CommandBoard;
///
/// # async fn example() -> Result<(), hvac_sequencer::error::HardwareError> {
/// let board = CommandBoard::new("megabas".into(), 0, CommandVerbs::default());
/// // megabas 0 trwr 2 1
/// board.write(2, OutputCommand::Triac(true)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CommandBoard {
    program: String,
    stack: u8,
    verbs: CommandVerbs,
}

impl CommandBoard {
    pub fn new(program: String, stack: u8, verbs: CommandVerbs) -> Self {
        Self {
            program,
            stack,
            verbs,
        }
    }

    pub fn read_args(&self, channel: u8, kind: ReadKind) -> Vec<String> {
        let verb = match kind {
            ReadKind::Voltage => &self.verbs.read_voltage,
            ReadKind::Resistance => &self.verbs.read_resistance,
            ReadKind::Digital => &self.verbs.read_digital,
        };
        vec![self.stack.to_string(), verb.clone(), channel.to_string()]
    }

    pub fn write_args(&self, channel: u8, command: OutputCommand) -> Vec<String> {
        let (verb, value) = match command {
            OutputCommand::Triac(on) => (&self.verbs.write_triac, switch_value(on)),
            OutputCommand::Relay(on) => (&self.verbs.write_relay, switch_value(on)),
            OutputCommand::Analog(volts) => (&self.verbs.write_analog, format!("{volts:.2}")),
        };
        vec![
            self.stack.to_string(),
            verb.clone(),
            channel.to_string(),
            value,
        ]
    }

    async fn run(&self, args: &[String]) -> Result<String, HardwareError> {
        #[cfg(debug_assertions)]
        {
            debug!("exec {} {}", self.program, args.join(" "));
        }
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HardwareError::Command(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HardwareError::Command(format!(
                "{} {} exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn switch_value(on: bool) -> String {
    let value = if on { "1" } else { "0" };
    value.to_string()
}

/// Parses the first numeric token of a board program's output.
pub fn parse_reading(stdout: &str) -> Result<f64, HardwareError> {
    stdout
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| HardwareError::Parse(stdout.trim().to_string()))
}

#[async_trait]
impl BoardIo for CommandBoard {
    async fn read(&self, channel: u8, kind: ReadKind) -> Result<f64, HardwareError> {
        let stdout = self.run(&self.read_args(channel, kind)).await?;
        parse_reading(&stdout)
    }

    async fn write(&self, channel: u8, command: OutputCommand) -> Result<(), HardwareError> {
        self.run(&self.write_args(channel, command)).await.map(|_| ())
    }
}
