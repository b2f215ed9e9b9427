use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};

use crate::error::{CliConfigError, FixtureError};
use crate::transport::{FakeBackendConfig, NotificationPayloads, ScanFixture};

/// Command-line options for the GATT session tool.
#[derive(Debug, Parser)]
#[command(name = "gattio", about = "Manage BLE GATT peripheral sessions from a central device.")]
pub struct Args {
    /// Uses the fake transport backend with fixture-driven peripherals.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `address|local_name|rssi|adv_hex;...`
    /// with `-` for absent fields.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Fake notification payloads as comma-separated hexadecimal payloads.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationPayloads>,
    /// Artificial fake discovery delay (e.g. `250ms`, `2s`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    /// Output format; defaults to pretty on a terminal and JSON otherwise.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputFormat>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Returns the requested output format, if any.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.format
    }

    /// Splits parsed CLI arguments into command and optional fake-backend
    /// settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI backend configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_scan,
            fake_notifications,
            fake_discovery_delay,
            format: _,
            command,
        } = self;

        let fake_args = if fake {
            let Some(scan_fixture) = fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan_fixture,
                notifications: fake_notifications,
                discovery_delay: fake_discovery_delay.unwrap_or(Duration::ZERO),
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    #[builder(with = |value: &str| -> Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationPayloads>,
    #[builder(default)]
    discovery_delay: Duration,
}

impl FakeArgs {
    /// Converts the parsed arguments into a fake-backend configuration.
    #[must_use]
    pub fn into_backend_config(self) -> FakeBackendConfig {
        let Self {
            scan_fixture,
            notifications,
            discovery_delay,
        } = self;

        FakeBackendConfig::builder()
            .peripherals(scan_fixture)
            .maybe_notifications(notifications)
            .discovery_delay(discovery_delay)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover advertising peripherals and print each one as it is found.
    Scan(ScanArgs),
    /// Connect to a peripheral, print its GATT tree, then disconnect.
    Inspect(InspectArgs),
    /// Connect and stream value changes from one characteristic.
    Listen(ListenArgs),
}

/// Arguments for the `scan` command.
#[derive(Debug, clap::Args)]
pub struct ScanArgs {
    /// Stop scanning after this duration (e.g. `10s`). If omitted, scan
    /// until Ctrl+C.
    #[arg(long, value_parser = parse_duration)]
    pub(crate) timeout: Option<Duration>,
    /// Report repeated advertisements from already-seen peripherals.
    #[arg(long)]
    pub(crate) duplicates: bool,
}

/// Arguments for the `inspect` command.
#[derive(Debug, clap::Args)]
pub struct InspectArgs {
    /// Address of the peripheral to inspect.
    pub(crate) address: String,
}

/// Arguments for the `listen` command.
#[derive(Debug, clap::Args)]
pub struct ListenArgs {
    /// Address of the peripheral to connect to.
    pub(crate) address: String,
    /// Characteristic to subscribe to, as a 16-bit or 128-bit UUID.
    #[arg(long)]
    pub(crate) characteristic: String,
    /// Stop after this many value changes. If omitted, listen until
    /// Ctrl+C.
    #[arg(long)]
    pub(crate) limit: Option<usize>,
}

/// Output rendering selection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines.
    Pretty,
    /// One JSON document per record.
    Json,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
