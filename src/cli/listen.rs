use std::io;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use owo_colors::OwoColorize;

use super::inspect::connect_and_list_services;
use super::{CliEvent, EventBridge, ListenArgs, format_payload, wait_for_event};
use crate::identifier::{PeripheralAddress, canonical_uuid, parse_attribute_uuid};
use crate::manager::SessionManager;

const SESSION_WAIT: Duration = Duration::from_secs(15);

/// Executes the `listen` command: connect, subscribe to one
/// characteristic and print value changes as they arrive.
pub(crate) async fn run<W>(
    manager: &SessionManager,
    args: &ListenArgs,
    out: &mut W,
) -> Result<()>
where
    W: io::Write,
{
    let characteristic = parse_attribute_uuid(&args.characteristic)
        .map_err(|error| anyhow!("invalid characteristic: {error}"))?;
    let characteristic_id = canonical_uuid(characteristic);

    let (bridge, mut events) = EventBridge::channel();
    manager.register_listener(bridge);
    let target = PeripheralAddress::new(&args.address);

    connect_and_list_services(manager, &mut events, &target).await?;
    manager
        .set_notifications(&args.characteristic, true)
        .await;
    writeln!(
        out,
        "listening on {} (Ctrl+C to stop)...",
        characteristic_id.bold()
    )?;

    let mut received = 0usize;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed while waiting for Ctrl+C")?;
                break;
            }
            event = events.recv() => match event {
                Some(CliEvent::CharacteristicChanged { characteristic, value })
                    if characteristic == characteristic_id =>
                {
                    received += 1;
                    writeln!(out, "#{received:<4} {}", format_payload(&value))?;
                    if let Some(limit) = args.limit
                        && received >= limit
                    {
                        break;
                    }
                }
                Some(CliEvent::UnexpectedDisconnection { address, status })
                    if address == target =>
                {
                    return Err(anyhow!("link lost while listening (status {status})"));
                }
                Some(CliEvent::Error(kind)) => {
                    return Err(anyhow!("listen rejected: {kind}"));
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    manager
        .set_notifications(&args.characteristic, false)
        .await;
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

    writeln!(out)?;
    writeln!(out, "{} {received} value change(s)", "done:".green())?;
    Ok(())
}
