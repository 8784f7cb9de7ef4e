use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use serde_json::json;
use snet_payments::escrow::top_up_escrow;
use snet_payments::service::account_balances;
use snet_payments::{Balances, Cogs};

use crate::context::{CliContext, parse_agi};

#[derive(Args)]
pub struct AccountArgs {
    #[command(subcommand)]
    pub command: AccountCommand,
}

#[derive(Subcommand)]
pub enum AccountCommand {
    /// Show escrow, token and allowance balances of the payer
    Balance,
    /// Move tokens into the escrow contract, approving the allowance if needed
    Deposit(AmountArgs),
    /// Move unlocked escrow back to the token balance
    Withdraw(AmountArgs),
}

#[derive(Args, Debug)]
pub struct AmountArgs {
    /// Amount in AGI
    #[arg(value_parser = parse_agi)]
    pub amount: Cogs,
}

pub async fn run(context: &CliContext, args: AccountArgs) -> Result<()> {
    let account = context.account()?;
    let ledger = context.ledger(&account)?;
    let address = account.address();

    match args.command {
        AccountCommand::Balance => {
            let balances = account_balances(ledger.as_ref(), &address).await?;
            print_balances(context.json, &balances)
        }
        AccountCommand::Deposit(AmountArgs { amount }) => {
            if amount == Cogs::ZERO {
                bail!("deposit amount must be positive");
            }
            let balance = ledger.escrow_balance(&address).await?;
            let target = balance.saturating_add(amount);
            let receipts = top_up_escrow(ledger.as_ref(), &address, target, target).await?;
            let balances = account_balances(ledger.as_ref(), &address).await?;
            crate::emit(
                context.json,
                &json!({ "receipts": receipts, "balances": balances }),
                || {
                    format!(
                        "deposited {} AGI in {} transaction(s), escrow now {} AGI",
                        amount.to_agi_string(),
                        receipts.len(),
                        balances.escrow.to_agi_string()
                    )
                },
            )
        }
        AccountCommand::Withdraw(AmountArgs { amount }) => {
            let balance = ledger.escrow_balance(&address).await?;
            if amount > balance {
                bail!(
                    "escrow holds {} AGI, cannot withdraw {} AGI",
                    balance.to_agi_string(),
                    amount.to_agi_string()
                );
            }
            let receipt = ledger.withdraw_from_escrow(amount).await?;
            tracing::info!(amount_cogs = %amount, tx_hash = %receipt.tx_hash, "withdrew from escrow");
            crate::emit(context.json, &receipt, || {
                format!(
                    "withdrew {} AGI in tx {}",
                    amount.to_agi_string(),
                    receipt.tx_hash
                )
            })
        }
    }
}

fn print_balances(json: bool, balances: &Balances) -> Result<()> {
    crate::emit(json, balances, || {
        format!(
            "account {}\n  escrow    {} AGI\n  tokens    {} AGI\n  allowance {} AGI",
            balances.address,
            balances.escrow.to_agi_string(),
            balances.tokens.to_agi_string(),
            balances.allowance.to_agi_string()
        )
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;
    use snet_payments::Cogs;

    use crate::{Commands, SnetCli};

    use super::AccountCommand;

    #[test]
    fn deposit_amount_is_parsed_as_agi() -> Result<(), clap::Error> {
        let cli = SnetCli::try_parse_from(["snet", "account", "deposit", "1.25"])?;
        match cli.command {
            Commands::Account(args) => match args.command {
                AccountCommand::Deposit(amount) => {
                    assert_eq!(amount.amount, Cogs::new(125_000_000));
                }
                _ => assert!(false, "expected deposit"),
            },
            _ => assert!(false, "expected account command"),
        }
        Ok(())
    }

    #[test]
    fn withdraw_requires_amount() {
        match SnetCli::try_parse_from(["snet", "account", "withdraw"]) {
            Ok(_) => assert!(false, "expected missing amount"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument),
        }
    }
}
