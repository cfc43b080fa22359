//! Binary entry point for the `olvm-builder` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use olvm_builder::{BuildConfig, BuildError, BuildSettings, Builder, Cancellation, ConfigError};

mod cli;

use cli::{Cli, Command};

/// Exit status reported when the build is interrupted, following the shell
/// convention for SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Build(BuildError::Interrupted) => INTERRUPTED_EXIT_CODE,
            Self::Config(_) | Self::Build(_) => 1,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            write_error(io::stderr(), &err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    let settings = BuildConfig::load_without_cli_args()?.prepare()?;
    match command {
        Command::Validate => {
            write_line(io::stdout(), &validation_summary(&settings));
            Ok(())
        }
        Command::Build => build(settings).await,
    }
}

async fn build(settings: BuildSettings) -> Result<(), CliError> {
    let cancellation = Cancellation::new();
    watch_for_interrupt(cancellation.clone());

    let builder = Builder::for_engine(settings, cancellation)?;
    let line = match builder.run().await? {
        Some(artifact) => format!("Build finished: {artifact}"),
        None => String::from("Build finished without producing a template"),
    };
    write_line(io::stdout(), &line);
    Ok(())
}

/// Cancels the build on the first Ctrl-C; steps in progress notice at their
/// next poll and cleanup still runs.
fn watch_for_interrupt(cancellation: Cancellation) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, cancelling the build");
                cancellation.cancel();
            }
            Err(err) => debug!(%err, "cannot listen for interrupts"),
        }
    });
}

fn validation_summary(settings: &BuildSettings) -> String {
    let kind = if settings.source.is_template() {
        "template"
    } else {
        "disk"
    };
    let mut summary = format!(
        "Configuration is valid: template '{}' from {kind} '{}' in cluster '{}'",
        settings.template.name,
        settings.source.label(),
        settings.cluster
    );
    if let Some(export) = &settings.export {
        summary.push_str(&format!(", exported to host '{}'", export.host));
    }
    summary
}

fn write_line(mut target: impl Write, line: &str) {
    writeln!(target, "{line}").ok();
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
