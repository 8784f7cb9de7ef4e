use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    ChannelFilter, ChannelInfo, ChannelOpenEvent, Ledger, LedgerError, OpenChannelRequest,
    OpenedChannel, TxReceipt,
};
use crate::units::{Address, Cogs, GroupId};

const GAS_OPEN_CHANNEL: u64 = 150_000;
const GAS_EXTEND_AND_ADD_FUNDS: u64 = 85_000;
const GAS_ADD_FUNDS: u64 = 60_000;
const GAS_EXTEND: u64 = 45_000;
const GAS_CLAIM_TIMEOUT: u64 = 70_000;
const GAS_APPROVE: u64 = 46_000;
const GAS_DEPOSIT: u64 = 72_000;
const GAS_WITHDRAW: u64 = 55_000;

#[derive(Debug, Default)]
struct LedgerState {
    block: u64,
    next_channel_id: u64,
    tx_count: u64,
    channels: BTreeMap<u64, ChannelInfo>,
    open_events: Vec<ChannelOpenEvent>,
    escrow: HashMap<Address, Cogs>,
    tokens: HashMap<Address, Cogs>,
    allowances: HashMap<Address, Cogs>,
    receipts: Vec<(String, TxReceipt)>,
}

impl LedgerState {
    fn include(&mut self, operation: &str, gas_used: u64) -> TxReceipt {
        self.tx_count += 1;
        self.block += 1;
        let receipt = TxReceipt {
            tx_hash: format!("0x{:064x}", self.tx_count),
            gas_used,
            block_number: self.block,
        };
        self.receipts.push((operation.to_string(), receipt.clone()));
        receipt
    }

    fn revert(&mut self, reason: impl Into<String>) -> LedgerError {
        self.tx_count += 1;
        LedgerError::Reverted {
            tx_hash: format!("0x{:064x}", self.tx_count),
            reason: reason.into(),
        }
    }

    fn debit_escrow(&mut self, owner: Address, amount: Cogs) -> Result<(), LedgerError> {
        let balance = self.escrow.get(&owner).copied().unwrap_or_default();
        if balance < amount {
            return Err(self.revert(format!(
                "escrow balance {balance} below required {amount}"
            )));
        }
        self.escrow.insert(owner, balance.saturating_sub(amount));
        Ok(())
    }

    fn owned_channel(&mut self, channel_id: u64, payer: Address) -> Result<ChannelInfo, LedgerError> {
        let Some(channel) = self.channels.get(&channel_id).cloned() else {
            return Err(LedgerError::ChannelMissing(channel_id));
        };
        if channel.sender != payer {
            return Err(self.revert("only the channel sender can fund or extend"));
        }
        Ok(channel)
    }
}

/// Deterministic in-process ledger with escrow-contract semantics.
///
/// Every write is included in its own block. All writes act as `payer`.
#[derive(Debug)]
pub struct InMemoryLedger {
    contract: Address,
    payer: Address,
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new(contract: Address, payer: Address, current_block: u64) -> Self {
        Self {
            contract,
            payer,
            state: Mutex::new(LedgerState {
                block: current_block,
                ..LedgerState::default()
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Internal("mutex poisoned: ledger state".to_string()))
    }

    pub fn set_block(&self, block: u64) -> Result<(), LedgerError> {
        self.lock()?.block = block;
        Ok(())
    }

    pub fn credit_tokens(&self, owner: Address, amount: Cogs) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let balance = state.tokens.entry(owner).or_default();
        *balance = balance.saturating_add(amount);
        Ok(())
    }

    pub fn credit_escrow(&self, owner: Address, amount: Cogs) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let balance = state.escrow.entry(owner).or_default();
        *balance = balance.saturating_add(amount);
        Ok(())
    }

    /// Registers an already-open channel (and its `ChannelOpen` event).
    pub fn insert_channel(
        &self,
        recipient: Address,
        group_id: GroupId,
        value: Cogs,
        expiration: u64,
    ) -> Result<u64, LedgerError> {
        let mut state = self.lock()?;
        let channel_id = state.next_channel_id;
        state.next_channel_id += 1;
        let block_number = state.block;
        let channel = ChannelInfo {
            channel_id,
            nonce: 0,
            sender: self.payer,
            signer: self.payer,
            recipient,
            group_id,
            value,
            expiration,
        };
        state.open_events.push(open_event(&channel, block_number));
        state.channels.insert(channel_id, channel);
        Ok(channel_id)
    }

    /// Operation names of every confirmed write, in order.
    pub fn operations(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self
            .lock()?
            .receipts
            .iter()
            .map(|(operation, _)| operation.clone())
            .collect())
    }
}

fn open_event(channel: &ChannelInfo, block_number: u64) -> ChannelOpenEvent {
    ChannelOpenEvent {
        channel_id: channel.channel_id,
        nonce: channel.nonce,
        sender: channel.sender,
        signer: channel.signer,
        recipient: channel.recipient,
        group_id: channel.group_id,
        amount: channel.value,
        expiration: channel.expiration,
        block_number,
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    fn contract_address(&self) -> Address {
        self.contract
    }

    async fn current_block(&self) -> Result<u64, LedgerError> {
        Ok(self.lock()?.block)
    }

    async fn channel(&self, channel_id: u64) -> Result<Option<ChannelInfo>, LedgerError> {
        Ok(self.lock()?.channels.get(&channel_id).cloned())
    }

    async fn open_channel_events(
        &self,
        filter: &ChannelFilter,
    ) -> Result<Vec<ChannelOpenEvent>, LedgerError> {
        Ok(self
            .lock()?
            .open_events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect())
    }

    async fn open_channel(
        &self,
        request: &OpenChannelRequest,
    ) -> Result<OpenedChannel, LedgerError> {
        let mut state = self.lock()?;
        state.debit_escrow(self.payer, request.amount)?;

        let channel_id = state.next_channel_id;
        state.next_channel_id += 1;
        let channel = ChannelInfo {
            channel_id,
            nonce: 0,
            sender: self.payer,
            signer: request.signer,
            recipient: request.recipient,
            group_id: request.group_id,
            value: request.amount,
            expiration: request.expiration,
        };
        let receipt = state.include("open_channel", GAS_OPEN_CHANNEL);
        state
            .open_events
            .push(open_event(&channel, receipt.block_number));
        state.channels.insert(channel_id, channel);
        Ok(OpenedChannel {
            channel_id,
            receipt,
        })
    }

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: u64,
        expiration: u64,
        amount: Cogs,
    ) -> Result<TxReceipt, LedgerError> {
        let mut state = self.lock()?;
        let channel = state.owned_channel(channel_id, self.payer)?;
        if expiration < channel.expiration {
            return Err(state.revert("expiration cannot decrease"));
        }
        state.debit_escrow(self.payer, amount)?;
        if let Some(stored) = state.channels.get_mut(&channel_id) {
            stored.expiration = expiration;
            stored.value = stored.value.saturating_add(amount);
        }
        Ok(state.include("channel_extend_and_add_funds", GAS_EXTEND_AND_ADD_FUNDS))
    }

    async fn channel_add_funds(
        &self,
        channel_id: u64,
        amount: Cogs,
    ) -> Result<TxReceipt, LedgerError> {
        let mut state = self.lock()?;
        state.owned_channel(channel_id, self.payer)?;
        state.debit_escrow(self.payer, amount)?;
        if let Some(stored) = state.channels.get_mut(&channel_id) {
            stored.value = stored.value.saturating_add(amount);
        }
        Ok(state.include("channel_add_funds", GAS_ADD_FUNDS))
    }

    async fn channel_extend(
        &self,
        channel_id: u64,
        expiration: u64,
    ) -> Result<TxReceipt, LedgerError> {
        let mut state = self.lock()?;
        let channel = state.owned_channel(channel_id, self.payer)?;
        if expiration < channel.expiration {
            return Err(state.revert("expiration cannot decrease"));
        }
        if let Some(stored) = state.channels.get_mut(&channel_id) {
            stored.expiration = expiration;
        }
        Ok(state.include("channel_extend", GAS_EXTEND))
    }

    async fn channel_claim_timeout(&self, channel_id: u64) -> Result<TxReceipt, LedgerError> {
        let mut state = self.lock()?;
        let channel = state.owned_channel(channel_id, self.payer)?;
        if state.block <= channel.expiration {
            return Err(state.revert(format!(
                "channel {channel_id} expires at block {}",
                channel.expiration
            )));
        }
        let refund = channel.value;
        let escrow = state.escrow.entry(self.payer).or_default();
        *escrow = escrow.saturating_add(refund);
        if let Some(stored) = state.channels.get_mut(&channel_id) {
            stored.value = Cogs::ZERO;
            stored.nonce += 1;
        }
        Ok(state.include("channel_claim_timeout", GAS_CLAIM_TIMEOUT))
    }

    async fn escrow_balance(&self, owner: &Address) -> Result<Cogs, LedgerError> {
        Ok(self.lock()?.escrow.get(owner).copied().unwrap_or_default())
    }

    async fn token_balance(&self, owner: &Address) -> Result<Cogs, LedgerError> {
        Ok(self.lock()?.tokens.get(owner).copied().unwrap_or_default())
    }

    async fn token_allowance(&self, owner: &Address) -> Result<Cogs, LedgerError> {
        Ok(self
            .lock()?
            .allowances
            .get(owner)
            .copied()
            .unwrap_or_default())
    }

    async fn approve_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError> {
        let mut state = self.lock()?;
        state.allowances.insert(self.payer, amount);
        Ok(state.include("approve_escrow", GAS_APPROVE))
    }

    async fn deposit_to_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError> {
        let mut state = self.lock()?;
        let tokens = state.tokens.get(&self.payer).copied().unwrap_or_default();
        let allowance = state
            .allowances
            .get(&self.payer)
            .copied()
            .unwrap_or_default();
        if tokens < amount {
            return Err(state.revert(format!("token balance {tokens} below {amount}")));
        }
        if allowance < amount {
            return Err(state.revert(format!("allowance {allowance} below {amount}")));
        }
        state
            .tokens
            .insert(self.payer, tokens.saturating_sub(amount));
        state
            .allowances
            .insert(self.payer, allowance.saturating_sub(amount));
        let escrow = state.escrow.entry(self.payer).or_default();
        *escrow = escrow.saturating_add(amount);
        Ok(state.include("deposit_to_escrow", GAS_DEPOSIT))
    }

    async fn withdraw_from_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError> {
        let mut state = self.lock()?;
        state.debit_escrow(self.payer, amount)?;
        let tokens = state.tokens.entry(self.payer).or_default();
        *tokens = tokens.saturating_add(amount);
        Ok(state.include("withdraw_from_escrow", GAS_WITHDRAW))
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryLedger;
    use crate::ledger::{ChannelFilter, Ledger, LedgerError, OpenChannelRequest};
    use crate::units::{Address, Cogs, GroupId};

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::from_bytes(bytes)
    }

    #[tokio::test]
    async fn open_channel_moves_escrow_into_channel() -> Result<(), LedgerError> {
        let payer = addr(1);
        let ledger = InMemoryLedger::new(addr(9), payer, 100);
        ledger.credit_escrow(payer, Cogs::new(1_000))?;

        let opened = ledger
            .open_channel(&OpenChannelRequest {
                signer: payer,
                recipient: addr(2),
                group_id: GroupId::from_bytes([3; 32]),
                amount: Cogs::new(400),
                expiration: 500,
            })
            .await?;

        assert_eq!(opened.receipt.block_number, 101);
        assert_eq!(ledger.escrow_balance(&payer).await?, Cogs::new(600));
        let channel = ledger.channel(opened.channel_id).await?;
        assert_eq!(channel.map(|c| c.value), Some(Cogs::new(400)));

        let events = ledger
            .open_channel_events(&ChannelFilter {
                sender: payer,
                recipient: addr(2),
                group_id: GroupId::from_bytes([3; 32]),
            })
            .await?;
        assert_eq!(events.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn funding_beyond_escrow_reverts() -> Result<(), LedgerError> {
        let payer = addr(1);
        let ledger = InMemoryLedger::new(addr(9), payer, 100);
        let channel_id = ledger.insert_channel(addr(2), GroupId::default(), Cogs::new(10), 200)?;

        let result = ledger.channel_add_funds(channel_id, Cogs::new(5)).await;
        assert!(matches!(result, Err(LedgerError::Reverted { .. })));
        assert!(ledger.operations()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn claim_timeout_requires_expiry_and_advances_nonce() -> Result<(), LedgerError> {
        let payer = addr(1);
        let ledger = InMemoryLedger::new(addr(9), payer, 100);
        let channel_id = ledger.insert_channel(addr(2), GroupId::default(), Cogs::new(10), 150)?;

        assert!(ledger.channel_claim_timeout(channel_id).await.is_err());

        ledger.set_block(151)?;
        ledger.channel_claim_timeout(channel_id).await?;
        let channel = ledger.channel(channel_id).await?;
        assert_eq!(channel.as_ref().map(|c| c.nonce), Some(1));
        assert_eq!(channel.map(|c| c.value), Some(Cogs::ZERO));
        assert_eq!(ledger.escrow_balance(&payer).await?, Cogs::new(10));
        Ok(())
    }

    #[tokio::test]
    async fn deposit_requires_allowance() -> Result<(), LedgerError> {
        let payer = addr(1);
        let ledger = InMemoryLedger::new(addr(9), payer, 0);
        ledger.credit_tokens(payer, Cogs::new(100))?;

        assert!(ledger.deposit_to_escrow(Cogs::new(50)).await.is_err());
        ledger.approve_escrow(Cogs::new(50)).await?;
        ledger.deposit_to_escrow(Cogs::new(50)).await?;

        assert_eq!(ledger.escrow_balance(&payer).await?, Cogs::new(50));
        assert_eq!(ledger.token_balance(&payer).await?, Cogs::new(50));
        assert_eq!(
            ledger.operations()?,
            vec!["approve_escrow".to_string(), "deposit_to_escrow".to_string()]
        );
        Ok(())
    }
}
