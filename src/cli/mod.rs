//! Command-line interface definitions for the `olvm-builder` binary.
//!
//! The parser lives here so both the binary and the build script can use it,
//! the latter to render the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `olvm-builder` binary.
///
/// Settings come from `olvm-builder.toml` (or the file named by
/// `OLVM_BUILDER_CONFIG_PATH`) and from `OLVM_*` environment variables.
#[derive(Debug, Parser)]
#[command(
    name = "olvm-builder",
    version,
    about = "Build OLVM/oVirt VM templates from a source template or disk",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log debug detail, including every engine request.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    /// Action to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands understood by `olvm-builder`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create a VM, provision it and turn it into a template.
    #[command(name = "build")]
    Build,
    /// Check the configuration without contacting the engine.
    #[command(name = "validate")]
    Validate,
}
