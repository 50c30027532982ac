// Command line surface: the worker takes no arguments besides help

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::ffi::OsString;

const ENVIRONMENT_HELP: &str = "\
Environment:
  YGG_LOG_LEVEL                          trace, debug, info, warn or error (default: info)
  YGG_SOCKET_ADDR                        dispatcher gRPC address; when unset the bus is used
  FOREMAN_YGG_WORKER_WORKDIR             job working directory (fallback: $XDG_RUNTIME_DIR, then /run)
  FOREMAN_YGG_WORKER_BUS_URL             NATS url (default: nats://localhost:4222)
  FOREMAN_YGG_WORKER_HANDSHAKE_TIMEOUT_MS registration timeout in ms (default: 1000)
  FOREMAN_YGG_WORKER_MAX_RETAINED_JOBS   finished jobs kept in memory (default: 1024)
  FOREMAN_YGG_WORKER_METRICS_PORT        Prometheus exporter port (default: disabled)";

#[derive(Parser, Debug)]
#[command(name = "foreman-ygg-worker")]
#[command(version)]
#[command(about = "Yggdrasil worker that runs foreman jobs")]
#[command(after_help = ENVIRONMENT_HELP)]
struct Cli {
    /// Rejected; the worker has no subcommands
    #[arg(value_name = "SUBCOMMAND", hide = true)]
    subcommand: Option<String>,
}

/// What `main` should do with the given arguments
#[derive(Debug, PartialEq, Eq)]
pub enum Invocation {
    Run,
    /// Print to stdout and exit 0
    Help(String),
    /// Print to stderr and exit 1
    Invalid(String),
}

pub fn interpret<I, T>(args: I) -> Invocation
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(Cli { subcommand: None }) => Invocation::Run,
        Ok(Cli {
            subcommand: Some(name),
        }) => Invocation::Invalid(format!(
            "Unknown subcommand: {}\n\n{}\n",
            name,
            Cli::command().render_usage()
        )),
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => Invocation::Help(e.to_string()),
            _ => Invocation::Invalid(e.to_string()),
        },
    }
}
