// Worker binary entry point

mod cli;

use anyhow::{Context, Result};
use cli::Invocation;
use common::bootstrap;
use common::config::Settings;
use common::executor::ScriptHandler;
use common::shutdown::install_shutdown_handler;
use common::telemetry;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    match cli::interpret(std::env::args_os()) {
        Invocation::Help(text) => {
            print!("{}", text);
            ExitCode::SUCCESS
        }
        Invocation::Invalid(text) => {
            eprint!("{}", text);
            ExitCode::FAILURE
        }
        Invocation::Run => match run_worker() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Worker terminated");
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

#[tokio::main]
async fn run_worker() -> Result<()> {
    let (settings, warnings) = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(&settings.log_level)?;
    for warning in &warnings {
        warn!(error = %warning, "Configuration problem, using default");
    }

    settings.validate().context("Invalid configuration")?;

    if let Some(port) = settings.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = settings.transport_name(),
        workdir = %settings.workdir.display(),
        "Starting foreman worker"
    );

    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;
    bootstrap::run(&settings, Arc::new(ScriptHandler::new()), shutdown).await
}
