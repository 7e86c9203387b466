//! Entry point for generator programs.
//!
//! A generator program declares its flags and targets in a registration
//! callback and hands it to [`main`]:
//!
//! ```no_run
//! fn main() -> std::process::ExitCode {
//!     dbt_graph_cli::main(|generator| {
//!         generator.declare_flag(dbt_graph::FlagSpec::bool("verbose").default_value(false))?;
//!         Ok(())
//!     })
//! }
//! ```

use std::{fs, io, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use dbt_graph::{Generator, GeneratorInput};
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub mod cli;

pub use cli::Args;

/// Environment variable holding the log filter, in `EnvFilter` syntax.
pub const LOG_ENV: &str = "DBT_LOG";

/// Parse the command line, run the generator, and report any failure.
pub fn main(register: impl FnOnce(&mut Generator) -> anyhow::Result<()>) -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    match run(&args, register) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Turn the request document named by `args` into a response document.
///
/// Any previous response is removed first, so a failed run never leaves a
/// stale response behind.
pub fn run(
    args: &Args,
    register: impl FnOnce(&mut Generator) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    match fs::remove_file(&args.output) {
        Ok(()) => debug!(path = %args.output.display(), "removed stale response"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| {
                format!("cannot remove stale response {}", args.output.display())
            });
        }
    }

    let input = GeneratorInput::load(&args.input)?;
    let mut generator = Generator::new(input)?;
    register(&mut generator).context("failed to declare targets")?;
    let output = generator.run()?;
    output.write(&args.output)?;
    Ok(())
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        })
    });
    // A subscriber may already be installed by an embedding program.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}
