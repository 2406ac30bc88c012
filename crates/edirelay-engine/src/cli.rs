// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command-line interface of the engine.

use std::path::PathBuf;

use clap::Parser;

use edirelay_core::Command;

/// Run the edirelay engine once.
///
/// Run-mode flags combine; without any of them (and without `--cleanup`) the
/// engine does a `--new` run.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "edirelay-engine")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Receive, translate and send new files.
    #[arg(long)]
    pub new: bool,

    /// Send again the files an operator flagged for retransmission.
    #[arg(long)]
    pub resend: bool,

    /// Process again the received files an operator flagged.
    #[arg(long)]
    pub rereceive: bool,

    /// Retry the sends that failed since the previous retry run.
    #[arg(long)]
    pub automaticretrycommunication: bool,

    /// Remove data older than the retention period.
    #[arg(long)]
    pub cleanup: bool,

    /// Directory holding `edirelay.env` and `catalog.json`.
    #[arg(short = 'c', long, env = "EDIRELAY_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    /// Restrict the run to these routes.
    #[arg(value_name = "ROUTE")]
    pub routes: Vec<String>,
}

impl Cli {
    /// Run commands in execution order. A crashed previous run puts
    /// `crashrecovery` in front.
    pub fn commands(&self, crashed: bool) -> Vec<Command> {
        let mut commands = Vec::new();
        if crashed {
            commands.push(Command::CrashRecovery);
        }
        let requested = [
            (self.automaticretrycommunication, Command::AutomaticRetryCommunication),
            (self.resend, Command::Resend),
            (self.rereceive, Command::Rereceive),
            (self.new, Command::New),
        ];
        let any = requested.iter().any(|(flag, _)| *flag);
        if !any && !self.cleanup {
            commands.push(Command::New);
        }
        commands.extend(
            requested
                .into_iter()
                .filter(|(flag, _)| *flag)
                .map(|(_, command)| command),
        );
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("edirelay-engine").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_is_new() {
        let cli = parse(&[]);
        assert_eq!(cli.commands(false), vec![Command::New]);
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_cleanup_alone_runs_no_command() {
        assert!(parse(&["--cleanup"]).commands(false).is_empty());
    }

    #[test]
    fn test_fixed_command_order() {
        let cli = parse(&["--new", "--resend", "--automaticretrycommunication"]);
        assert_eq!(
            cli.commands(true),
            vec![
                Command::CrashRecovery,
                Command::AutomaticRetryCommunication,
                Command::Resend,
                Command::New,
            ]
        );
    }

    #[test]
    fn test_routes_and_config_dir() {
        let cli = parse(&["-c", "/etc/edirelay", "--rereceive", "orders", "invoices"]);
        assert_eq!(cli.config_dir, PathBuf::from("/etc/edirelay"));
        assert_eq!(cli.routes, vec!["orders", "invoices"]);
        assert_eq!(cli.commands(false), vec![Command::Rereceive]);
    }
}
