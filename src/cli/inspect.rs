use std::io;
use std::time::Duration;

use anyhow::{Result, anyhow};
use owo_colors::OwoColorize;
use tokio::sync::mpsc;

use super::{CliEvent, EventBridge, InspectArgs, OutputFormat, wait_for_event};
use crate::identifier::{PeripheralAddress, canonical_uuid};
use crate::manager::SessionManager;
use crate::model::ServiceNode;

const DISCOVERY_WAIT: Duration = Duration::from_secs(30);
const SESSION_WAIT: Duration = Duration::from_secs(15);

/// Executes the `inspect` command: discover, connect, list the GATT tree,
/// disconnect.
pub(crate) async fn run<W>(
    manager: &SessionManager,
    args: &InspectArgs,
    format: OutputFormat,
    out: &mut W,
) -> Result<()>
where
    W: io::Write,
{
    let (bridge, mut events) = EventBridge::channel();
    manager.register_listener(bridge);
    let target = PeripheralAddress::new(&args.address);

    let services = connect_and_list_services(manager, &mut events, &target).await?;
    print_services(&target, &services, format, out)?;

    manager.disconnect(target.as_str()).await;
    let target_for_match = target.clone();
    let disconnected = wait_for_event(&mut events, SESSION_WAIT, move |event| match event {
        CliEvent::Disconnected { address } if address == target_for_match => Ok(Some(())),
        _ => Ok(None),
    })
    .await;
    if disconnected.is_err() {
        tracing::debug!(%target, "no disconnect confirmation before exit");
    }
    Ok(())
}

/// Discovers the target, connects and waits for its service tree.
pub(crate) async fn connect_and_list_services(
    manager: &SessionManager,
    events: &mut mpsc::UnboundedReceiver<CliEvent>,
    target: &PeripheralAddress,
) -> Result<Vec<ServiceNode>> {
    manager.start_discovery(None, false).await;
    let target_for_match = target.clone();
    wait_for_event(events, DISCOVERY_WAIT, move |event| match event {
        CliEvent::PeripheralFound(peripheral) if peripheral.address() == &target_for_match => {
            Ok(Some(()))
        }
        _ => Ok(None),
    })
    .await
    .map_err(|_| anyhow!("peripheral {target} was not discovered"))?;
    manager.stop_discovery().await;

    manager.connect(target.as_str()).await;
    let target_for_match = target.clone();
    wait_for_event(events, SESSION_WAIT, move |event| match event {
        CliEvent::Connected { address } if address == target_for_match => Ok(Some(())),
        CliEvent::ConnectionFailure { address, status } if address == target_for_match => {
            Err(anyhow!("connection failed with status {status}"))
        }
        CliEvent::Error(kind) => Err(anyhow!("connect rejected: {kind}")),
        _ => Ok(None),
    })
    .await?;

    manager.list_services(target.as_str()).await;
    let target_for_match = target.clone();
    wait_for_event(events, SESSION_WAIT, move |event| match event {
        CliEvent::ServicesDiscovered { address, services } if address == target_for_match => {
            Ok(Some(services))
        }
        CliEvent::UnexpectedDisconnection { address, status } if address == target_for_match => {
            Err(anyhow!("link lost during discovery (status {status})"))
        }
        CliEvent::Error(kind) => Err(anyhow!("service discovery rejected: {kind}")),
        _ => Ok(None),
    })
    .await
}

fn print_services<W>(
    address: &PeripheralAddress,
    services: &[ServiceNode],
    format: OutputFormat,
    out: &mut W,
) -> Result<()>
where
    W: io::Write,
{
    match format {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(services)?)?;
        }
        OutputFormat::Pretty => {
            writeln!(out, "{} {}", "connected:".green(), address.bold())?;
            for service in services {
                let kind = if service.is_primary() {
                    "primary"
                } else {
                    "secondary"
                };
                writeln!(out, "service {} ({kind})", canonical_uuid(service.uuid()).bold())?;
                for characteristic in service.characteristics() {
                    writeln!(
                        out,
                        "  characteristic {}  [{}]",
                        canonical_uuid(characteristic.uuid()),
                        characteristic.properties().join(", "),
                    )?;
                    for descriptor in characteristic.descriptors() {
                        writeln!(out, "    descriptor {}", canonical_uuid(descriptor.uuid()))?;
                    }
                }
            }
        }
    }
    Ok(())
}
