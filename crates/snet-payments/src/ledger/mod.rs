//! Ledger collaborator seam: channel and escrow reads, funding transactions,
//! and the `ChannelOpen` event log.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::units::{Address, Cogs, GroupId};

pub use http::{HttpLedgerGateway, HttpLedgerGatewayConfig};
pub use memory::InMemoryLedger;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api error ({status}): {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("transaction {tx_hash} reverted: {reason}")]
    Reverted { tx_hash: String, reason: String },
    #[error("channel {0} does not exist")]
    ChannelMissing(u64),
    #[error("internal: {0}")]
    Internal(String),
}

/// On-chain view of a payment channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: u64,
    pub nonce: u64,
    pub sender: Address,
    pub signer: Address,
    pub recipient: Address,
    pub group_id: GroupId,
    pub value: Cogs,
    pub expiration: u64,
}

/// `ChannelOpen` log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpenEvent {
    pub channel_id: u64,
    pub nonce: u64,
    pub sender: Address,
    pub signer: Address,
    pub recipient: Address,
    pub group_id: GroupId,
    pub amount: Cogs,
    pub expiration: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub sender: Address,
    pub recipient: Address,
    pub group_id: GroupId,
}

impl ChannelFilter {
    #[must_use]
    pub fn matches(&self, event: &ChannelOpenEvent) -> bool {
        event.sender == self.sender
            && event.recipient == self.recipient
            && event.group_id == self.group_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub signer: Address,
    pub recipient: Address,
    pub group_id: GroupId,
    pub amount: Cogs,
    pub expiration: u64,
}

/// Confirmation of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub gas_used: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedChannel {
    pub channel_id: u64,
    pub receipt: TxReceipt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingOperation {
    ApproveEscrow,
    DepositToEscrow,
    OpenChannel,
    ChannelExtendAndAddFunds,
    ChannelAddFunds,
    ChannelExtend,
}

/// Receipt of a funding transaction issued while preparing a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FundingReceipt {
    pub operation: FundingOperation,
    pub receipt: TxReceipt,
}

impl FundingReceipt {
    #[must_use]
    pub fn new(operation: FundingOperation, receipt: TxReceipt) -> Self {
        Self { operation, receipt }
    }
}

/// Contract bindings for the escrow contract and its token.
///
/// Write operations resolve only once the transaction is confirmed. The
/// sending account is the one the implementation is bound to.
#[async_trait]
pub trait Ledger: Send + Sync {
    fn contract_address(&self) -> Address;

    async fn current_block(&self) -> Result<u64, LedgerError>;

    async fn channel(&self, channel_id: u64) -> Result<Option<ChannelInfo>, LedgerError>;

    async fn open_channel_events(
        &self,
        filter: &ChannelFilter,
    ) -> Result<Vec<ChannelOpenEvent>, LedgerError>;

    async fn open_channel(
        &self,
        request: &OpenChannelRequest,
    ) -> Result<OpenedChannel, LedgerError>;

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: u64,
        expiration: u64,
        amount: Cogs,
    ) -> Result<TxReceipt, LedgerError>;

    async fn channel_add_funds(
        &self,
        channel_id: u64,
        amount: Cogs,
    ) -> Result<TxReceipt, LedgerError>;

    async fn channel_extend(
        &self,
        channel_id: u64,
        expiration: u64,
    ) -> Result<TxReceipt, LedgerError>;

    async fn channel_claim_timeout(&self, channel_id: u64) -> Result<TxReceipt, LedgerError>;

    async fn escrow_balance(&self, owner: &Address) -> Result<Cogs, LedgerError>;

    async fn token_balance(&self, owner: &Address) -> Result<Cogs, LedgerError>;

    async fn token_allowance(&self, owner: &Address) -> Result<Cogs, LedgerError>;

    async fn approve_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError>;

    async fn deposit_to_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError>;

    async fn withdraw_from_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError>;
}
