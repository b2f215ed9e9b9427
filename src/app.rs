use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::cli::{Command, OutputFormat};
use crate::manager::SessionManager;
use crate::model::ServiceState;
use crate::telemetry;
use crate::transport::{TransportBackend, backend_clients};

/// Runs one CLI command against the selected transport backend.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = gattio::Args::try_parse_from([
///     "gattio",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC|HRM-Strap|-43|-",
///     "scan",
///     "--timeout",
///     "100ms",
/// ])?;
/// let output_format = args.output_format().unwrap_or(gattio::OutputFormat::Json);
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let backend = match maybe_fake_args {
///     Some(fake_args) => gattio::TransportBackend::Fake(fake_args.into_backend_config()),
///     None => gattio::TransportBackend::Real,
/// };
/// let mut out = Vec::new();
/// gattio::run(command, &mut out, backend, output_format, false).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the backend cannot
/// be constructed, the command fails or output writing fails.
#[instrument(
    skip(out, backend),
    level = "info",
    fields(command = command_name(&command), ?output_format)
)]
pub async fn run<W>(
    command: Command,
    out: &mut W,
    backend: TransportBackend,
    output_format: OutputFormat,
    interactive_terminal: bool,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing("gattio", interactive_terminal)?;

    let (transport, scanner, events) = backend_clients(backend).await?;
    let manager = SessionManager::new(transport, scanner);
    let pump = manager.spawn_event_pump(events);
    manager.set_service_state(ServiceState::Active);

    let result = match command {
        Command::Scan(args) => crate::cli::scan::run(&manager, &args, output_format, out).await,
        Command::Inspect(args) => {
            crate::cli::inspect::run(&manager, &args, output_format, out).await
        }
        Command::Listen(args) => crate::cli::listen::run(&manager, &args, out).await,
    };

    manager.shutdown().await;
    pump.abort();
    result
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Scan(_args) => "scan",
        Command::Inspect(_args) => "inspect",
        Command::Listen(_args) => "listen",
    }
}
