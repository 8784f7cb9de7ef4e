#![expect(clippy::print_stdout, reason = "command output goes to stdout")]

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod account_cli;
mod channel_cli;
mod context;
mod job_cli;

use context::CliContext;

#[derive(Parser)]
#[command(name = "snet")]
#[command(about = "SingularityNET payment channels and paid service calls")]
pub struct SnetCli {
    /// Config file (defaults to $SNET_CONFIG, then ~/.snet/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Run against an in-memory ledger instead of the gateway
    #[arg(long, global = true)]
    pub dry_run: bool,
    /// Token balance credited to the payer in the in-memory ledger, in AGI
    #[arg(long, global = true, value_name = "AGI", requires = "dry_run", value_parser = context::parse_agi)]
    pub dry_run_tokens: Option<snet_payments::Cogs>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Paid service calls
    Job(job_cli::JobArgs),
    /// Payment channel utilities (list, state, claim-timeout)
    Channel(channel_cli::ChannelArgs),
    /// Escrow account utilities (balance, deposit, withdraw)
    Account(account_cli::AccountArgs),
}

pub async fn run() -> anyhow::Result<()> {
    let cli = SnetCli::parse();
    init_tracing(cli.verbose);

    let context = CliContext::load(&cli)?;
    match cli.command {
        Commands::Job(args) => job_cli::run(&context, args).await,
        Commands::Channel(args) => channel_cli::run(&context, args).await,
        Commands::Account(args) => account_cli::run(&context, args).await,
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Prints `value` as pretty JSON, or the text rendering otherwise.
pub(crate) fn emit<T: serde::Serialize>(
    json: bool,
    value: &T,
    text: impl FnOnce() -> String,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;

    use super::{Commands, SnetCli};

    #[test]
    fn cli_requires_subcommand() {
        match SnetCli::try_parse_from(["snet"]) {
            Ok(_) => assert!(false, "expected missing subcommand parse error"),
            Err(err) => assert_eq!(
                err.kind(),
                ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ),
        }
    }

    #[test]
    fn cli_rejects_unknown_subcommand() {
        match SnetCli::try_parse_from(["snet", "unknown-subcommand"]) {
            Ok(_) => assert!(false, "expected invalid subcommand parse error"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::InvalidSubcommand),
        }
    }

    #[test]
    fn global_flags_are_accepted_after_subcommand() -> Result<(), clap::Error> {
        let cli = SnetCli::try_parse_from([
            "snet",
            "account",
            "balance",
            "--json",
            "--dry-run",
            "--dry-run-tokens",
            "2.5",
        ])?;
        assert!(cli.json);
        assert!(cli.dry_run);
        assert_eq!(
            cli.dry_run_tokens,
            Some(snet_payments::Cogs::new(250_000_000))
        );
        assert!(matches!(cli.command, Commands::Account(_)));
        Ok(())
    }

    #[test]
    fn dry_run_tokens_require_dry_run() {
        match SnetCli::try_parse_from(["snet", "account", "balance", "--dry-run-tokens", "1"]) {
            Ok(_) => assert!(false, "expected missing --dry-run error"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument),
        }
    }
}
