//! subprocd: spawns child processes on request over an inherited control
//! socket and reports their output and exit status on per-request status
//! pipes.

mod control;
mod forwarder;
mod launcher;
mod reactor;
mod reaper;
mod settings;
mod signals;
mod status;
mod supervisor;

use std::io;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::reactor::{Exit, Reactor};
use crate::settings::Settings;

const LOG_ENV: &str = "SUBPROCD_LOG";

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();
    info!(
        "{}",
        subproc_build_info::version_line(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    );

    let settings = Settings::from_env();
    launcher::seal_inherited_descriptors();
    info!(
        control_fd = settings.control_fd,
        kill_grace_ms = settings.kill_grace.as_millis() as u64,
        read_chunk = settings.read_chunk,
        "Starting"
    );

    let reactor = Reactor::new(settings).context("Failed to start subprocd")?;
    match reactor.run().await {
        Exit::Finished => Ok(()),
        Exit::Crashed(signal) => signals::reraise(signal),
    }
}
