//! Job policy inputs and their resolution into concrete funding and
//! expiration thresholds.
//!
//! Resolution fails fast, before any ledger mutation, whenever the thresholds
//! would authorize a voucher the service is bound to reject or would leave a
//! freshly funded channel short on the next run.

use serde::{Deserialize, Serialize};

use crate::error::PaymentError;
use crate::units::Cogs;

/// Blocks past `current + threshold` a channel must at least live.
pub const MIN_EXPIRATION_OFFSET: u64 = 12;
/// Blocks past `current + threshold` an extension targets by default.
pub const TOPUP_EXPIRATION_OFFSET: u64 = 240;

/// Caller policy for one job. Unset thresholds are derived at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub autohandle_channel: bool,
    pub autohandle_escrow: bool,
    pub channel_min_amount: Option<Cogs>,
    pub channel_topup_amount: Option<Cogs>,
    pub channel_min_expiration: Option<u64>,
    pub channel_topup_expiration: Option<u64>,
    pub escrow_min_amount: Option<Cogs>,
    pub escrow_topup_amount: Option<Cogs>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            autohandle_channel: true,
            autohandle_escrow: false,
            channel_min_amount: None,
            channel_topup_amount: None,
            channel_min_expiration: None,
            channel_topup_expiration: None,
            escrow_min_amount: None,
            escrow_topup_amount: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpirationThresholds {
    pub min_expiration: u64,
    pub topup_expiration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AmountThresholds {
    pub channel_min_amount: Cogs,
    pub channel_topup_amount: Cogs,
    pub escrow_min_amount: Cogs,
    pub escrow_topup_amount: Cogs,
}

/// Thresholds in force for one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedJobOptions {
    pub autohandle_channel: bool,
    pub autohandle_escrow: bool,
    pub expiration: ExpirationThresholds,
    pub amounts: AmountThresholds,
}

#[must_use]
pub fn expiration_floor(current_block: u64, threshold: u64) -> u64 {
    current_block
        .saturating_add(threshold)
        .saturating_add(MIN_EXPIRATION_OFFSET)
}

pub fn resolve_expiration(
    options: &JobOptions,
    current_block: u64,
    threshold: u64,
) -> Result<ExpirationThresholds, PaymentError> {
    let floor = expiration_floor(current_block, threshold);
    let default_topup = current_block
        .saturating_add(threshold)
        .saturating_add(TOPUP_EXPIRATION_OFFSET);

    let min_expiration = options.channel_min_expiration.unwrap_or(floor);
    let topup_expiration = options
        .channel_topup_expiration
        .unwrap_or_else(|| default_topup.max(min_expiration));

    if min_expiration < floor || topup_expiration < min_expiration || topup_expiration < floor {
        return Err(PaymentError::InvalidExpirationOptions {
            min_expiration,
            topup_expiration,
            floor,
        });
    }

    Ok(ExpirationThresholds {
        min_expiration,
        topup_expiration,
    })
}

/// `signed_amount` is the cumulative amount already authorized on the
/// channel; `price` is the cost of the job about to run.
pub fn resolve_amount(
    options: &JobOptions,
    signed_amount: Cogs,
    price: Cogs,
    escrow_balance: Cogs,
) -> Result<AmountThresholds, PaymentError> {
    let required = signed_amount.saturating_add(price);

    let channel_min_amount = options.channel_min_amount.unwrap_or(required);
    let channel_topup_amount = options.channel_topup_amount.unwrap_or(channel_min_amount);
    if channel_min_amount < required
        || channel_topup_amount < channel_min_amount
        || channel_topup_amount < required
    {
        return Err(PaymentError::InvalidAmountOptions {
            min_amount: channel_min_amount,
            topup_amount: channel_topup_amount,
            required,
        });
    }

    if !options.autohandle_escrow && escrow_balance < required {
        return Err(PaymentError::InsufficientEscrowFunds {
            balance: escrow_balance,
            required,
        });
    }

    let escrow_min_amount = options.escrow_min_amount.unwrap_or(channel_min_amount);
    let escrow_topup_amount = options
        .escrow_topup_amount
        .unwrap_or_else(|| channel_topup_amount.max(escrow_min_amount));
    if escrow_min_amount < required
        || escrow_topup_amount < escrow_min_amount
        || escrow_topup_amount < required
    {
        return Err(PaymentError::InvalidEscrowAmountOptions {
            min_amount: escrow_min_amount,
            topup_amount: escrow_topup_amount,
            required,
        });
    }

    Ok(AmountThresholds {
        channel_min_amount,
        channel_topup_amount,
        escrow_min_amount,
        escrow_topup_amount,
    })
}
