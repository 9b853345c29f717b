//! # Command Line Interface
//!
//! `run` starts the controller, `create` turns a protobuf payload into a
//! configuration object manifest and `bootstrap` writes an Envoy bootstrap that
//! points at the controller. Failures map to sysexits-style exit codes.

pub mod bootstrap;
pub mod create;
pub mod run;

use clap::{Parser, Subcommand};

use crate::xds::kinds::ProtocolVersion;

/// Command line usage error.
pub const EX_USAGE: u8 = 64;
/// Input data was incorrect.
pub const EX_DATAERR: u8 = 65;
/// Configuration error.
pub const EX_CONFIG: u8 = 78;
/// Any other failure.
pub const EX_FAIL: u8 = 1;

/// An error carrying the process exit code it maps to.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ExitError {
    pub code: u8,
    pub message: String,
}

impl ExitError {
    pub fn new(code: u8, message: impl std::fmt::Display) -> Self {
        Self { code, message: message.to_string() }
    }
}

#[derive(Parser)]
#[command(name = "envoy-controller")]
#[command(about = "Controller for the Envoy proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the Envoy controller
    Run(run::RunArgs),

    /// Create an Envoy resource from a file or stdin
    Create(create::CreateArgs),

    /// Write an Envoy bootstrap configuration
    Bootstrap(bootstrap::BootstrapArgs),
}

/// `-2` / `-3` selection shared by the commands that take an API version.
#[derive(clap::Args, Debug, Clone, Copy, Default)]
pub struct VersionFlags {
    /// Use the Envoy v2 API
    #[arg(short = '2')]
    pub v2: bool,

    /// Use the Envoy v3 API
    #[arg(short = '3')]
    pub v3: bool,
}

impl VersionFlags {
    /// The selected version, `None` when neither flag is set.
    pub fn selected(&self) -> Result<Option<ProtocolVersion>, ExitError> {
        match (self.v2, self.v3) {
            (true, true) => Err(ExitError::new(EX_USAGE, "multiple Envoy API versions specified")),
            (true, false) => Ok(Some(ProtocolVersion::V2)),
            (false, true) => Ok(Some(ProtocolVersion::V3)),
            (false, false) => Ok(None),
        }
    }
}

/// Parse arguments and run the selected command.
pub async fn run_cli() -> Result<(), ExitError> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => {
            // --help and --version
            let _ = e.print();
            return Ok(());
        }
        Err(e) => return Err(ExitError::new(EX_USAGE, e.render().to_string().trim_end())),
    };

    match cli.command {
        Commands::Run(args) => run::run(args, cli.debug).await,
        Commands::Create(args) => create::create(args),
        Commands::Bootstrap(args) => bootstrap::bootstrap(args),
    }
}
