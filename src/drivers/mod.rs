//! Hardware drivers: shell-command I/O boards and the serial vibration sensor.

pub mod command_board;
pub mod vibration;

#[cfg(test)]
pub mod fake;
