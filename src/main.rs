use std::fs::File;

use anyhow::{Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};

use hvac_sequencer::{application::Application, cli::Cli, config::ConfigManager};

const DAEMON_LOG: &str = "/var/tmp/hvac-sequencerd.log";

fn init_syslog() -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: "hvac-sequencerd".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|()| log::set_max_level(LevelFilter::Info))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn init_stderr(level: LevelFilter) -> Result<()> {
    env_logger::Builder::new()
        .filter_level(level)
        .try_init()
        .map_err(|e| anyhow!("{e}"))
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_LOG)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // fork before the runtime spawns its threads
    if cli.daemonize {
        into_daemon()?;
        init_syslog()?;
    } else {
        init_stderr(cli.foreground_log_level)?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let config_manager = ConfigManager::load(cli.config).await?;
            Application::builder()
                .with_config_manager(config_manager)
                .build()
                .await?
                .run()
                .await
        })
}
