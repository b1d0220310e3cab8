use clap::Parser;

use crate::config::Backend;

/// Command line flags understood by every driver binary. Flags override the
/// settings file and environment.
#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Execution backend.
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Output directory (can be local or in S3).
    #[arg(short, long)]
    pub out: Option<String>,

    /// Write a peak-memory report to this file on exit.
    #[arg(long)]
    pub memprofile: Option<String>,

    /// Output verbose logs.
    #[arg(short, long)]
    pub verbose: bool,

    /// Undeploy the remote function without running the driver.
    #[arg(long)]
    pub undeploy: bool,

    /// Input files or globs, appended to the configured inputs.
    #[clap(value_parser)]
    pub inputs: Vec<String>,
}
