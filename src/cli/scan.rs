use std::io;
use std::time::Duration;

use anyhow::Result;
use owo_colors::OwoColorize;
use tokio::time::sleep;

use super::{CliEvent, EventBridge, OutputFormat, ScanArgs, format_rssi};
use crate::identifier::canonical_uuid;
use crate::manager::SessionManager;
use crate::model::DiscoveredPeripheral;

/// Executes the `scan` command.
pub(crate) async fn run<W>(
    manager: &SessionManager,
    args: &ScanArgs,
    format: OutputFormat,
    out: &mut W,
) -> Result<()>
where
    W: io::Write,
{
    let (bridge, mut events) = EventBridge::channel();
    manager.register_listener(bridge);

    manager.start_discovery(args.timeout, args.duplicates).await;
    if format == OutputFormat::Pretty {
        writeln!(out, "scanning for peripherals (Ctrl+C to stop)...")?;
    }

    let mut found = 0usize;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            () = sleep(Duration::from_millis(200)), if args.timeout.is_some() => {
                if !manager.discovery_active().await {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(CliEvent::PeripheralFound(peripheral)) => {
                    found += 1;
                    print_peripheral(&peripheral, format, out)?;
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    manager.stop_discovery().await;
    if format == OutputFormat::Pretty {
        writeln!(out)?;
        writeln!(out, "{} {found} advertisement(s) observed", "done:".green())?;
    }
    Ok(())
}

fn print_peripheral<W>(
    peripheral: &DiscoveredPeripheral,
    format: OutputFormat,
    out: &mut W,
) -> Result<()>
where
    W: io::Write,
{
    match format {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string(peripheral)?)?;
        }
        OutputFormat::Pretty => {
            let services: Vec<String> = peripheral
                .service_uuids()
                .iter()
                .map(|uuid| canonical_uuid(*uuid))
                .collect();
            writeln!(
                out,
                "{}  {:>9}  {}  [{}]",
                peripheral.address().bold(),
                format_rssi(peripheral.rssi()),
                peripheral.local_name().unwrap_or("-"),
                services.join(", "),
            )?;
        }
    }
    Ok(())
}
