//! Channel selection: reuse the payer's latest channel to a service group, or
//! open a new one when policy allows.

use std::sync::Arc;

use serde_json::json;

use crate::channel::PaymentChannel;
use crate::error::PaymentError;
use crate::escrow::top_up_escrow;
use crate::events::{JobEventLog, JobStage};
use crate::ledger::{
    ChannelFilter, ChannelOpenEvent, FundingOperation, FundingReceipt, Ledger, OpenChannelRequest,
};
use crate::options::{ExpirationThresholds, JobOptions, resolve_amount};
use crate::signer::Account;
use crate::units::{Address, Cogs, GroupId};

/// Payment group of a service the channel must pay into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub recipient: Address,
    pub group_id: GroupId,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct ChannelSelection {
    pub channel: PaymentChannel,
    pub is_new: bool,
    pub receipts: Vec<FundingReceipt>,
}

pub struct ChannelSelector {
    ledger: Arc<dyn Ledger>,
    account: Arc<Account>,
}

impl ChannelSelector {
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, account: Arc<Account>) -> Self {
        Self { ledger, account }
    }

    /// `ChannelOpen` events from the payer to the target group.
    pub async fn available_channels(
        &self,
        target: &ChannelTarget,
    ) -> Result<Vec<ChannelOpenEvent>, PaymentError> {
        let filter = ChannelFilter {
            sender: self.account.address(),
            recipient: target.recipient,
            group_id: target.group_id,
        };
        Ok(self.ledger.open_channel_events(&filter).await?)
    }

    /// Resolves the channel a job pays through.
    ///
    /// A requested channel must belong to the payer and target group. Without
    /// one, the most recently opened channel (largest id) wins. A new channel
    /// is opened only under `autohandle_channel`, funded to the resolved
    /// top-up amount and expiration.
    pub async fn resolve(
        &self,
        target: &ChannelTarget,
        requested: Option<u64>,
        options: &JobOptions,
        price: Cogs,
        expiration: &ExpirationThresholds,
        events: &mut JobEventLog,
    ) -> Result<ChannelSelection, PaymentError> {
        events.emit(
            JobStage::RequestAvailableChannels,
            json!({
                "sender": self.account.address(),
                "recipient": target.recipient,
                "group_id": target.group_id,
            }),
        );
        let available = self.available_channels(target).await?;
        let ids: Vec<u64> = available.iter().map(|event| event.channel_id).collect();
        events.emit(JobStage::ReplyAvailableChannels, json!({ "channels": ids }));

        let existing = match requested {
            Some(channel_id) => {
                if !ids.contains(&channel_id) {
                    return Err(PaymentError::ChannelNotFound {
                        channel_id: Some(channel_id),
                        reason: format!(
                            "channel {channel_id} is not open from {} to {} in group {}",
                            self.account.address(),
                            target.recipient,
                            target.group_id
                        ),
                    });
                }
                Some(channel_id)
            }
            None => latest_channel_id(&available),
        };

        let (channel_id, is_new, receipts) = match existing {
            Some(channel_id) => (channel_id, false, Vec::new()),
            None => {
                if !options.autohandle_channel {
                    return Err(PaymentError::ChannelNotFound {
                        channel_id: None,
                        reason: format!(
                            "no open channel to {} in group {} and channel autohandling is off",
                            target.recipient, target.group_id
                        ),
                    });
                }
                let (channel_id, receipts) =
                    self.open_new(target, options, price, expiration, events).await?;
                (channel_id, true, receipts)
            }
        };

        let channel =
            PaymentChannel::load(self.ledger.as_ref(), channel_id, target.endpoint.clone()).await?;
        events.emit(
            JobStage::ResolvedChannel,
            json!({
                "channel_id": channel.channel_id,
                "is_new": is_new,
                "nonce": channel.nonce,
                "value": channel.value,
                "expiration": channel.expiration,
            }),
        );
        tracing::info!(
            channel_id = channel.channel_id,
            is_new,
            value_cogs = %channel.value,
            expiration = channel.expiration,
            "resolved payment channel"
        );
        Ok(ChannelSelection {
            channel,
            is_new,
            receipts,
        })
    }

    async fn open_new(
        &self,
        target: &ChannelTarget,
        options: &JobOptions,
        price: Cogs,
        expiration: &ExpirationThresholds,
        events: &mut JobEventLog,
    ) -> Result<(u64, Vec<FundingReceipt>), PaymentError> {
        let payer = self.account.address();
        let escrow_balance = self.ledger.escrow_balance(&payer).await?;
        let amounts = resolve_amount(options, Cogs::ZERO, price, escrow_balance)?;
        let amount = amounts.channel_topup_amount;

        let mut receipts = if options.autohandle_escrow {
            top_up_escrow(
                self.ledger.as_ref(),
                &payer,
                amount,
                amounts.escrow_topup_amount,
            )
            .await?
        } else if escrow_balance < amount {
            return Err(PaymentError::InsufficientEscrowFunds {
                balance: escrow_balance,
                required: amount,
            });
        } else {
            Vec::new()
        };

        let request = OpenChannelRequest {
            signer: payer,
            recipient: target.recipient,
            group_id: target.group_id,
            amount,
            expiration: expiration.topup_expiration,
        };
        events.emit(
            JobStage::RequestNewChannel,
            json!({
                "recipient": request.recipient,
                "group_id": request.group_id,
                "amount": request.amount,
                "expiration": request.expiration,
            }),
        );
        let opened = self.ledger.open_channel(&request).await?;
        events.emit(
            JobStage::ReplyNewChannel,
            json!({
                "channel_id": opened.channel_id,
                "tx_hash": opened.receipt.tx_hash,
                "gas_used": opened.receipt.gas_used,
            }),
        );
        receipts.push(FundingReceipt::new(
            FundingOperation::OpenChannel,
            opened.receipt,
        ));
        Ok((opened.channel_id, receipts))
    }
}

/// Largest id stands in for the most recently opened channel.
#[must_use]
pub fn latest_channel_id(events: &[ChannelOpenEvent]) -> Option<u64> {
    events.iter().map(|event| event.channel_id).max()
}
