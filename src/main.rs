use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;

use gattio::{Args, OutputFormat, TransportBackend, run};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let interactive_terminal = std::io::stderr().is_terminal();
        let output_format = args.output_format().unwrap_or(if stdout.is_terminal() {
            OutputFormat::Pretty
        } else {
            OutputFormat::Json
        });
        let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
        let backend = match maybe_fake_args {
            Some(fake_args) => TransportBackend::Fake(fake_args.into_backend_config()),
            None => TransportBackend::Real,
        };

        run(
            command,
            &mut stdout,
            backend,
            output_format,
            interactive_terminal,
        )
        .await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
