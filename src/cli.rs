use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// hvac-sequencerd: real-time HVAC control and output sequencing daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: $HVAC_SEQUENCER_CONFIG, then XDG, then /etc)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach and log to syslog
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Log level when running in the foreground
    #[arg(short = 'l', long = "foreground-log-level", default_value = "info")]
    pub foreground_log_level: LevelFilter,
}
