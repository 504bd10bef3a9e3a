use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "upkeep")]
#[command(about = "Self-update and durable feedback telemetry for unattended desktop binaries")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (use multiple times for more detail)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reduce output to errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check whether a newer release is published, without installing it
    Check,

    /// Download the latest release, swap it in and restart
    Update,

    /// File an error report for the most recent result
    Report {
        /// What went wrong
        #[arg(short, long)]
        message: String,

        /// Extra technical context as key=value pairs
        #[arg(short = 'd', long = "data")]
        data: Vec<String>,
    },

    /// Show statistics over locally stored feedback
    Stats,

    /// Retry delivery of queued feedback records
    Flush,

    /// Show the current version
    Version,

    /// Swap helper, invoked by the updater on the downloaded binary.
    /// Waits for the parent to exit, replaces the installed binary and
    /// relaunches it.
    #[command(hide = true)]
    FinalizeUpdate {
        /// Path of the downloaded new binary
        #[arg(long)]
        source: PathBuf,

        /// Path of the installed binary to replace
        #[arg(long)]
        target: PathBuf,

        /// Pid of the process being updated
        #[arg(long)]
        pid: u32,

        /// Version being installed, written to the marker on success
        #[arg(long)]
        release_version: String,
    },
}
