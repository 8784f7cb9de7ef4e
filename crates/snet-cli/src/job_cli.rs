use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Subcommand};
use serde_json::{Value, json};
use snet_payments::{Cogs, JobEvent, JobOptions, JobOutcome, JobRequest, MethodName};
use tokio::sync::mpsc;

use crate::context::{CliContext, ServiceArgs, parse_agi};

#[derive(Args)]
pub struct JobArgs {
    #[command(subcommand)]
    pub command: JobCommand,
}

#[derive(Subcommand)]
pub enum JobCommand {
    /// Call a service method, paying through a payment channel
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub service: ServiceArgs,
    /// Method as `package.Service/method` or `Service/method`
    pub method: MethodName,
    /// JSON request body
    #[arg(long, default_value = "{}", value_parser = parse_json)]
    pub params: Value,
    /// Pay through this channel instead of selecting one
    #[arg(long)]
    pub channel_id: Option<u64>,
    /// Abandon the job after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
    /// Print each lifecycle event as it happens
    #[arg(long)]
    pub events: bool,
    #[command(flatten)]
    pub policy: PolicyArgs,
}

/// Per-job overrides of the configured `[job]` policy. Amounts are in AGI.
#[derive(Args, Debug)]
pub struct PolicyArgs {
    /// Never open, fund or extend channels
    #[arg(long)]
    pub no_autohandle_channel: bool,
    /// Deposit to escrow when a channel operation needs more funds
    #[arg(long)]
    pub autohandle_escrow: bool,
    #[arg(long, value_name = "AGI", value_parser = parse_agi)]
    pub channel_min_amount: Option<Cogs>,
    #[arg(long, value_name = "AGI", value_parser = parse_agi)]
    pub channel_topup_amount: Option<Cogs>,
    #[arg(long, value_name = "BLOCK")]
    pub channel_min_expiration: Option<u64>,
    #[arg(long, value_name = "BLOCK")]
    pub channel_topup_expiration: Option<u64>,
    #[arg(long, value_name = "AGI", value_parser = parse_agi)]
    pub escrow_min_amount: Option<Cogs>,
    #[arg(long, value_name = "AGI", value_parser = parse_agi)]
    pub escrow_topup_amount: Option<Cogs>,
}

impl PolicyArgs {
    fn apply(&self, mut options: JobOptions) -> JobOptions {
        if self.no_autohandle_channel {
            options.autohandle_channel = false;
        }
        if self.autohandle_escrow {
            options.autohandle_escrow = true;
        }
        options.channel_min_amount = self.channel_min_amount.or(options.channel_min_amount);
        options.channel_topup_amount = self.channel_topup_amount.or(options.channel_topup_amount);
        options.channel_min_expiration = self
            .channel_min_expiration
            .or(options.channel_min_expiration);
        options.channel_topup_expiration = self
            .channel_topup_expiration
            .or(options.channel_topup_expiration);
        options.escrow_min_amount = self.escrow_min_amount.or(options.escrow_min_amount);
        options.escrow_topup_amount = self.escrow_topup_amount.or(options.escrow_topup_amount);
        options
    }
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|error| format!("invalid JSON: {error}"))
}

pub async fn run(context: &CliContext, args: JobArgs) -> Result<()> {
    match args.command {
        JobCommand::Run(args) => run_job(context, args).await,
    }
}

async fn run_job(context: &CliContext, args: RunArgs) -> Result<()> {
    let client = context.service_client(&args.service).await?;
    let options = args.policy.apply(context.config.job.clone());
    let mut request = JobRequest::new(args.method, args.params).with_options(options);
    if let Some(channel_id) = args.channel_id {
        request = request.with_channel(channel_id);
    }

    let (observer, printer) = if args.events && !context.json {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                println!("[{:>2}] {} {}", event.seq, event.stage, event.payload);
            }
        });
        (Some(tx), Some(printer))
    } else {
        (None, None)
    };

    let job = async {
        match observer {
            Some(observer) => client.run_job_with_observer(request, observer).await,
            None => client.run_job(request).await,
        }
    };
    let result = match args.timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), job)
            .await
            .map_err(|_| anyhow!("job abandoned after {secs}s"))?,
        None => job.await,
    };
    if let Some(printer) = printer {
        printer.await.context("event printer")?;
    }

    let outcome = result?;
    print_outcome(context.json, &outcome)
}

fn print_outcome(json: bool, outcome: &JobOutcome) -> Result<()> {
    let stats = &outcome.summary.stats;
    crate::emit(
        json,
        &json!({
            "response": outcome.response,
            "summary": outcome.summary,
            "events": outcome.events,
        }),
        || {
            let mut text = serde_json::to_string_pretty(&outcome.response)
                .unwrap_or_else(|_| outcome.response.to_string());
            text.push_str(&format!(
                "\nchannel {} nonce {} signed {} AGI, {} transaction(s){}",
                stats.channel_id,
                stats.nonce,
                stats.amount_signed.to_agi_string(),
                stats.total_tx,
                if outcome.summary.is_new_channel {
                    " (new channel)"
                } else {
                    ""
                },
            ));
            text
        },
    )
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use serde_json::json;
    use snet_payments::{Cogs, JobOptions};

    use crate::{Commands, SnetCli};

    use super::{JobCommand, RunArgs};

    fn parse_run(args: &[&str]) -> Result<RunArgs, clap::Error> {
        let cli = SnetCli::try_parse_from(args.iter().copied())?;
        match cli.command {
            Commands::Job(job) => match job.command {
                JobCommand::Run(run) => Ok(run),
            },
            _ => Err(clap::Error::new(clap::error::ErrorKind::InvalidSubcommand)),
        }
    }

    #[test]
    fn run_parses_method_params_and_policy() -> Result<(), clap::Error> {
        let run = parse_run(&[
            "snet",
            "job",
            "run",
            "snet",
            "example-service",
            "example_service.Calculator/add",
            "--params",
            r#"{"a":5,"b":8}"#,
            "--channel-topup-amount",
            "0.5",
            "--channel-min-expiration",
            "1200",
            "--autohandle-escrow",
        ])?;
        assert_eq!(run.service.org_id, "snet");
        assert_eq!(run.method.to_string(), "example_service.Calculator/add");
        assert_eq!(run.params, json!({ "a": 5, "b": 8 }));

        let base = JobOptions {
            channel_topup_expiration: Some(9_000),
            ..JobOptions::default()
        };
        let options = run.policy.apply(base);
        assert!(options.autohandle_channel);
        assert!(options.autohandle_escrow);
        assert_eq!(options.channel_topup_amount, Some(Cogs::new(50_000_000)));
        assert_eq!(options.channel_min_expiration, Some(1_200));
        assert_eq!(options.channel_topup_expiration, Some(9_000));
        Ok(())
    }

    #[test]
    fn run_rejects_malformed_method_and_params() {
        for args in [
            &["snet", "job", "run", "org", "svc", "add"][..],
            &["snet", "job", "run", "org", "svc", "Calc/add", "--params", "{"][..],
        ] {
            match parse_run(args) {
                Ok(run) => assert!(false, "expected parse failure, got {run:?}"),
                Err(err) => assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation),
            }
        }
    }

    #[test]
    fn no_autohandle_channel_disables_channel_management() -> Result<(), clap::Error> {
        let run = parse_run(&[
            "snet",
            "job",
            "run",
            "org",
            "svc",
            "Calc/add",
            "--no-autohandle-channel",
        ])?;
        assert!(!run.policy.apply(JobOptions::default()).autohandle_channel);
        Ok(())
    }
}
