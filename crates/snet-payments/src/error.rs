use std::collections::BTreeMap;

use crate::ledger::LedgerError;
use crate::units::{Cogs, UnitError};

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("account has no signing key")]
    NoSigningKey,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("channel not found: {reason}")]
    ChannelNotFound {
        channel_id: Option<u64>,
        reason: String,
    },
    #[error("channel state unavailable for channel {channel_id}: {message}")]
    ChannelStateUnavailable { channel_id: u64, message: String },
    #[error("channel state malformed for channel {channel_id}: {message}")]
    ChannelStateMalformed { channel_id: u64, message: String },
    #[error(
        "invalid expiration options: min_expiration={min_expiration} topup_expiration={topup_expiration} floor={floor}"
    )]
    InvalidExpirationOptions {
        min_expiration: u64,
        topup_expiration: u64,
        floor: u64,
    },
    #[error(
        "invalid amount options: channel_min_amount={min_amount} channel_topup_amount={topup_amount} required={required}"
    )]
    InvalidAmountOptions {
        min_amount: Cogs,
        topup_amount: Cogs,
        required: Cogs,
    },
    #[error("insufficient escrow funds: balance={balance} required={required}")]
    InsufficientEscrowFunds { balance: Cogs, required: Cogs },
    #[error(
        "invalid escrow amount options: escrow_min_amount={min_amount} escrow_topup_amount={topup_amount} required={required}"
    )]
    InvalidEscrowAmountOptions {
        min_amount: Cogs,
        topup_amount: Cogs,
        required: Cogs,
    },
    #[error("channel {channel_id} has insufficient funds or is expiring: {}", format_defects(.defects))]
    InsufficientFundsOrExpired {
        channel_id: u64,
        defects: BTreeMap<ChannelDefect, DefectDetail>,
    },
    #[error("service call {method} failed: {message}")]
    ServiceCallError {
        method: String,
        request: serde_json::Value,
        message: String,
    },
    #[error("channel {channel_id} expires at block {expiration}, current block is {current_block}")]
    ChannelNotExpired {
        channel_id: u64,
        expiration: u64,
        current_block: u64,
    },
    #[error("invalid service metadata: {0}")]
    InvalidServiceMetadata(String),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Unit(#[from] UnitError),
}

impl PaymentError {
    /// Stable machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoSigningKey => "no_signing_key",
            Self::Signing(_) => "signing_failed",
            Self::ChannelNotFound { .. } => "channel_not_found",
            Self::ChannelStateUnavailable { .. } => "channel_state_unavailable",
            Self::ChannelStateMalformed { .. } => "channel_state_malformed",
            Self::InvalidExpirationOptions { .. } => "invalid_expiration_options",
            Self::InvalidAmountOptions { .. } => "invalid_amount_options",
            Self::InsufficientEscrowFunds { .. } => "insufficient_escrow_funds",
            Self::InvalidEscrowAmountOptions { .. } => "invalid_escrow_amount_options",
            Self::InsufficientFundsOrExpired { .. } => "insufficient_funds_or_expired",
            Self::ServiceCallError { .. } => "service_call_error",
            Self::ChannelNotExpired { .. } => "channel_not_expired",
            Self::InvalidServiceMetadata(_) => "invalid_service_metadata",
            Self::Ledger(_) => "ledger_error",
            Self::Unit(_) => "invalid_unit",
        }
    }
}

/// Named shortfall of a channel against the resolved job thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDefect {
    ChannelLessthanTopupAmount,
    ChannelLessthanTopupExpiration,
}

impl ChannelDefect {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelLessthanTopupAmount => "channel_lessthan_topup_amount",
            Self::ChannelLessthanTopupExpiration => "channel_lessthan_topup_expiration",
        }
    }
}

/// Observed value against the minimum the job requires.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum DefectDetail {
    Cogs { current: Cogs, required: Cogs },
    Block { current: u64, required: u64 },
}

fn format_defects(defects: &BTreeMap<ChannelDefect, DefectDetail>) -> String {
    defects
        .iter()
        .map(|(defect, detail)| match detail {
            DefectDetail::Cogs { current, required } => {
                format!("{}(current={current}, required={required})", defect.as_str())
            }
            DefectDetail::Block { current, required } => {
                format!("{}(current={current}, required={required})", defect.as_str())
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
