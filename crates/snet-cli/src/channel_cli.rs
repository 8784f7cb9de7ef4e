use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use crate::context::{CliContext, ServiceArgs};

#[derive(Args)]
pub struct ChannelArgs {
    #[command(subcommand)]
    pub command: ChannelCommand,
}

#[derive(Subcommand)]
pub enum ChannelCommand {
    /// List the payer's channels to the service's payment group
    List(ServiceArgs),
    /// Show a channel together with the daemon's last accepted voucher
    State(ChannelIdArgs),
    /// Reclaim the unspent value of an expired channel
    ClaimTimeout(ChannelIdArgs),
}

#[derive(Args, Debug)]
pub struct ChannelIdArgs {
    #[command(flatten)]
    pub service: ServiceArgs,
    pub channel_id: u64,
}

pub async fn run(context: &CliContext, args: ChannelArgs) -> Result<()> {
    match args.command {
        ChannelCommand::List(service) => {
            let client = context.service_client(&service).await?;
            let channels = client.list_channels().await?;
            crate::emit(context.json, &channels, || {
                if channels.is_empty() {
                    return "No channels".to_string();
                }
                channels
                    .iter()
                    .map(|channel| {
                        format!(
                            "{:>6}  nonce {:<4} value {:>14} AGI  expires at block {}",
                            channel.channel_id,
                            channel.nonce,
                            channel.value.to_agi_string(),
                            channel.expiration
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        ChannelCommand::State(args) => {
            let client = context.service_client(&args.service).await?;
            let (channel, state) = client.channel_state(args.channel_id).await?;
            let (nonce, signed) = state.effective_for(&channel);
            crate::emit(
                context.json,
                &json!({
                    "channel": channel,
                    "state": state,
                    "available": channel.available(signed),
                }),
                || {
                    format!(
                        "channel {}\n  on-chain nonce {} value {} AGI, expires at block {}\n  \
                         daemon nonce {} signed {} AGI\n  available {} AGI",
                        channel.channel_id,
                        channel.nonce,
                        channel.value.to_agi_string(),
                        channel.expiration,
                        nonce,
                        signed.to_agi_string(),
                        channel.available(signed).to_agi_string()
                    )
                },
            )
        }
        ChannelCommand::ClaimTimeout(args) => {
            let client = context.service_client(&args.service).await?;
            let receipt = client.claim_timeout(args.channel_id).await?;
            crate::emit(context.json, &receipt, || {
                format!("claimed channel {} in tx {}", args.channel_id, receipt.tx_hash)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;

    use crate::{Commands, SnetCli};

    use super::ChannelCommand;

    #[test]
    fn claim_timeout_takes_service_and_channel_id() -> Result<(), clap::Error> {
        let cli = SnetCli::try_parse_from([
            "snet",
            "channel",
            "claim-timeout",
            "snet",
            "example-service",
            "42",
            "--group",
            "default_group",
        ])?;
        match cli.command {
            Commands::Channel(args) => match args.command {
                ChannelCommand::ClaimTimeout(args) => {
                    assert_eq!(args.channel_id, 42);
                    assert_eq!(args.service.group.as_deref(), Some("default_group"));
                }
                _ => assert!(false, "expected claim-timeout"),
            },
            _ => assert!(false, "expected channel command"),
        }
        Ok(())
    }

    #[test]
    fn state_rejects_non_numeric_channel_id() {
        match SnetCli::try_parse_from(["snet", "channel", "state", "org", "svc", "latest"]) {
            Ok(_) => assert!(false, "expected invalid channel id"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::ValueValidation),
        }
    }
}
