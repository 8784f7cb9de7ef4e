use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::channel::PaymentChannel;
use crate::error::{ChannelDefect, DefectDetail, PaymentError};
use crate::escrow::top_up_escrow;
use crate::events::{JobEventLog, JobStage};
use crate::ledger::{FundingOperation, FundingReceipt, Ledger, TxReceipt};
use crate::options::ResolvedJobOptions;
use crate::signer::Account;
use crate::units::Cogs;

/// Shortfalls of a channel against the job's minimum thresholds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ChannelValidity {
    defects: BTreeMap<ChannelDefect, DefectDetail>,
}

impl ChannelValidity {
    #[must_use]
    pub fn check(channel: &PaymentChannel, options: &ResolvedJobOptions) -> Self {
        let mut defects = BTreeMap::new();
        let min_amount = options.amounts.channel_min_amount;
        if channel.value < min_amount {
            defects.insert(
                ChannelDefect::ChannelLessthanTopupAmount,
                DefectDetail::Cogs {
                    current: channel.value,
                    required: min_amount,
                },
            );
        }
        let min_expiration = options.expiration.min_expiration;
        if channel.expiration < min_expiration {
            defects.insert(
                ChannelDefect::ChannelLessthanTopupExpiration,
                DefectDetail::Block {
                    current: channel.expiration,
                    required: min_expiration,
                },
            );
        }
        Self { defects }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.defects.is_empty()
    }

    #[must_use]
    pub fn has(&self, defect: ChannelDefect) -> bool {
        self.defects.contains_key(&defect)
    }

    #[must_use]
    pub fn defects(&self) -> &BTreeMap<ChannelDefect, DefectDetail> {
        &self.defects
    }
}

/// Cures channel defects through funding transactions, waiting on each
/// confirmation before returning.
pub struct ChannelStabilizer {
    ledger: Arc<dyn Ledger>,
    account: Arc<Account>,
}

impl ChannelStabilizer {
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, account: Arc<Account>) -> Self {
        Self { ledger, account }
    }

    /// Issues the smallest set of operations that lifts `channel` to the
    /// top-up thresholds, then re-reads it from the ledger.
    pub async fn stabilize(
        &self,
        channel: &mut PaymentChannel,
        validity: &ChannelValidity,
        options: &ResolvedJobOptions,
        events: &mut JobEventLog,
    ) -> Result<Vec<FundingReceipt>, PaymentError> {
        if validity.is_valid() {
            return Ok(Vec::new());
        }
        if !options.autohandle_channel {
            return Err(PaymentError::InsufficientFundsOrExpired {
                channel_id: channel.channel_id,
                defects: validity.defects().clone(),
            });
        }

        let needs_funds = validity.has(ChannelDefect::ChannelLessthanTopupAmount);
        let needs_extension = validity.has(ChannelDefect::ChannelLessthanTopupExpiration);
        let add_amount = if needs_funds {
            options
                .amounts
                .channel_topup_amount
                .saturating_sub(channel.value)
        } else {
            Cogs::ZERO
        };
        let expiration = options
            .expiration
            .topup_expiration
            .max(channel.expiration);

        let mut receipts = Vec::new();
        if add_amount > Cogs::ZERO {
            receipts.extend(self.ensure_escrow(add_amount, options).await?);
        }

        let channel_id = channel.channel_id;
        let (operation, receipt) = if needs_funds && needs_extension {
            events.emit(
                JobStage::RequestChannelExtendAndAddFunds,
                json!({ "channel_id": channel_id, "expiration": expiration, "amount": add_amount }),
            );
            let receipt = self
                .ledger
                .channel_extend_and_add_funds(channel_id, expiration, add_amount)
                .await?;
            events.emit(
                JobStage::ReplyChannelExtendAndAddFunds,
                receipt_payload(channel_id, &receipt),
            );
            (FundingOperation::ChannelExtendAndAddFunds, receipt)
        } else if needs_funds {
            events.emit(
                JobStage::RequestChannelAddFunds,
                json!({ "channel_id": channel_id, "amount": add_amount }),
            );
            let receipt = self.ledger.channel_add_funds(channel_id, add_amount).await?;
            events.emit(
                JobStage::ReplyChannelAddFunds,
                receipt_payload(channel_id, &receipt),
            );
            (FundingOperation::ChannelAddFunds, receipt)
        } else {
            events.emit(
                JobStage::RequestChannelExtendExpiration,
                json!({ "channel_id": channel_id, "expiration": expiration }),
            );
            let receipt = self.ledger.channel_extend(channel_id, expiration).await?;
            events.emit(
                JobStage::ReplyChannelExtendExpiration,
                receipt_payload(channel_id, &receipt),
            );
            (FundingOperation::ChannelExtend, receipt)
        };
        tracing::info!(
            channel_id,
            operation = ?operation,
            tx_hash = %receipt.tx_hash,
            amount_cogs = %add_amount,
            expiration,
            "stabilized payment channel"
        );
        receipts.push(FundingReceipt::new(operation, receipt));

        channel.refresh(self.ledger.as_ref()).await?;
        Ok(receipts)
    }

    async fn ensure_escrow(
        &self,
        amount: Cogs,
        options: &ResolvedJobOptions,
    ) -> Result<Vec<FundingReceipt>, PaymentError> {
        let payer = self.account.address();
        if options.autohandle_escrow {
            return top_up_escrow(
                self.ledger.as_ref(),
                &payer,
                amount,
                options.amounts.escrow_topup_amount,
            )
            .await;
        }
        let balance = self.ledger.escrow_balance(&payer).await?;
        if balance < amount {
            return Err(PaymentError::InsufficientEscrowFunds {
                balance,
                required: amount,
            });
        }
        Ok(Vec::new())
    }
}

fn receipt_payload(channel_id: u64, receipt: &TxReceipt) -> serde_json::Value {
    json!({
        "channel_id": channel_id,
        "tx_hash": receipt.tx_hash,
        "gas_used": receipt.gas_used,
        "block_number": receipt.block_number,
    })
}
