use std::path::PathBuf;

use clap::Parser;

/// Minimal CLI: locate the config file and allow container/systemd-style
/// identity and bind overrides without editing it. Every other setting comes
/// from the config file itself (§6.4).
#[derive(Debug, Clone, Parser)]
#[command(name = "meeseeksd", version, about = "Meeseeks cluster job execution daemon")]
pub struct Cli {
    /// Path to the box's JSON config file.
    #[arg(long, env = "MEESEEKSD_CONFIG")]
    pub config: PathBuf,

    /// Overrides the box name read from the config file.
    #[arg(long)]
    pub name: Option<String>,

    /// Overrides `listen.address`.
    #[arg(long)]
    pub listen_address: Option<String>,

    /// Overrides `listen.port`.
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Raises this crate's log level to `debug` (`-v`) or `trace` (`-vv`).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}
