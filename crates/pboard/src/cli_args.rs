use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Top-level CLI entrypoint.
///
/// The OS deep-link handler relaunches this binary with the custom-scheme URL
/// as a bare trailing argument, so anything positional is accepted and
/// scanned rather than validated up front.
#[derive(Parser, Debug, Clone)]
#[command(name = "pboard", version, about = "Pulseboard desktop client service")]
pub struct Cli {
    /// Positional arguments; a `pulseboard://` URL may appear among them.
    #[arg(value_name = "ARG")]
    pub args: Vec<String>,

    /// Path to the development launch script; switches scheme registration
    /// into development mode.
    #[arg(long, value_name = "SCRIPT")]
    pub dev_script: Option<PathBuf>,

    /// Skip registering the custom URI scheme with the OS.
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_register: bool,

    /// Override the IPC port from config.
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Log to stderr only instead of the persistent log file.
    #[arg(long, action = ArgAction::SetTrue)]
    pub stderr_log: bool,
}
