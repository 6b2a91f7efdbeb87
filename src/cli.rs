//! Command-line interface.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "wristlink", about = "Mac <-> Watch room relay", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay server (the default when no subcommand is given)
    Start,
    /// Print the version and exit
    Version,
}

pub fn handle_version() {
    println!("wristlink {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_defaults_to_start() {
        let cli = Cli::parse_from(["wristlink"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn start_and_version_parse() {
        assert!(matches!(
            Cli::parse_from(["wristlink", "start"]).command,
            Some(Command::Start)
        ));
        assert!(matches!(
            Cli::parse_from(["wristlink", "version"]).command,
            Some(Command::Version)
        ));
    }
}
