//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Concord persistence and cross-server sync node.
#[derive(Debug, Parser)]
#[command(name = "concord-node")]
#[command(version)]
pub struct Cli {
    /// Configuration file path.
    #[arg(long, short = 'c', default_value = "concord.yaml", global = true)]
    pub config: PathBuf,

    /// Log level, used when `RUST_LOG` is unset (overrides `logging.level`).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit JSON log lines (overrides `logging.json`).
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// What to do; runs the node when omitted.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Node subcommands.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the sync service until Ctrl-C.
    Run,
    /// Back up, import, and validate the legacy file store.
    MigrateLegacy,
    /// Write every stored record into a directory in the legacy layout.
    ExportLegacy {
        /// Target directory.
        #[arg(long)]
        out: PathBuf,
    },
    /// Back up the legacy files and the store.
    Backup {
        /// Label for the backup directory.
        #[arg(long, default_value = "manual")]
        name: String,
    },
    /// Compare legacy file counts with stored record counts.
    Validate,
    /// Show applied and pending schema migrations.
    Migrations,
}

impl Cli {
    /// The subcommand to run, defaulting to [`Command::Run`].
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_runs_the_node() {
        let cli = Cli::try_parse_from(["concord-node"]).unwrap();
        assert_eq!(cli.command(), Command::Run);
        assert_eq!(cli.config, PathBuf::from("concord.yaml"));
    }

    #[test]
    fn subcommands_parse_with_global_flags() {
        let cli = Cli::try_parse_from([
            "concord-node",
            "export-legacy",
            "--out",
            "/tmp/legacy",
            "--config",
            "node.yaml",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(
            cli.command(),
            Command::ExportLegacy {
                out: PathBuf::from("/tmp/legacy")
            }
        );
        assert_eq!(cli.config, PathBuf::from("node.yaml"));
        assert!(cli.json_logs);

        let backup = Cli::try_parse_from(["concord-node", "backup"]).unwrap();
        assert_eq!(
            backup.command(),
            Command::Backup {
                name: "manual".to_owned()
            }
        );
    }
}
