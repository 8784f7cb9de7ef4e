//! Payment channel record as observed on the ledger, and the remote voucher
//! checkpoint kept by the service daemon.

use serde::Serialize;

use crate::error::PaymentError;
use crate::ledger::{ChannelInfo, Ledger};
use crate::units::{Address, Cogs, GroupId};

/// Ledger truth for one channel plus the service endpoint it pays for.
///
/// Never mutated off-chain; `refresh` re-reads the ledger after funding
/// operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentChannel {
    pub channel_id: u64,
    pub nonce: u64,
    pub sender: Address,
    pub signer: Address,
    pub recipient: Address,
    pub group_id: GroupId,
    pub value: Cogs,
    pub expiration: u64,
    pub endpoint: String,
}

impl PaymentChannel {
    #[must_use]
    pub fn from_info(info: ChannelInfo, endpoint: impl Into<String>) -> Self {
        Self {
            channel_id: info.channel_id,
            nonce: info.nonce,
            sender: info.sender,
            signer: info.signer,
            recipient: info.recipient,
            group_id: info.group_id,
            value: info.value,
            expiration: info.expiration,
            endpoint: endpoint.into(),
        }
    }

    pub async fn load(
        ledger: &dyn Ledger,
        channel_id: u64,
        endpoint: impl Into<String>,
    ) -> Result<Self, PaymentError> {
        let info = ledger
            .channel(channel_id)
            .await?
            .ok_or_else(|| PaymentError::ChannelNotFound {
                channel_id: Some(channel_id),
                reason: format!("channel {channel_id} is not on the ledger"),
            })?;
        Ok(Self::from_info(info, endpoint))
    }

    pub async fn refresh(&mut self, ledger: &dyn Ledger) -> Result<(), PaymentError> {
        let refreshed = Self::load(ledger, self.channel_id, self.endpoint.clone()).await?;
        *self = refreshed;
        Ok(())
    }

    /// Funds not yet authorized to the service.
    #[must_use]
    pub fn available(&self, signed_amount: Cogs) -> Cogs {
        self.value.saturating_sub(signed_amount)
    }

    #[must_use]
    pub fn is_expired_at(&self, block: u64) -> bool {
        block > self.expiration
    }
}

/// Highest voucher the service daemon has accepted for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelState {
    pub channel_id: u64,
    pub current_nonce: u64,
    pub current_signed_amount: Cogs,
    #[serde(serialize_with = "serialize_hex")]
    pub current_signature: Vec<u8>,
}

impl ChannelState {
    /// Voucher baseline for `channel`.
    ///
    /// A daemon that has not yet observed a newer on-chain nonce reports the
    /// previous round; the new round starts from zero.
    #[must_use]
    pub fn effective_for(&self, channel: &PaymentChannel) -> (u64, Cogs) {
        if self.current_nonce < channel.nonce {
            (channel.nonce, Cogs::ZERO)
        } else {
            (self.current_nonce, self.current_signed_amount)
        }
    }
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}
