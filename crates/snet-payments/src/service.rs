//! Client for one service payment group: metadata, channel utilities and paid
//! job execution composed over the ledger, signer and transport seams.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::Span;

use crate::channel::{ChannelState, PaymentChannel};
use crate::error::PaymentError;
use crate::events::JobEvent;
use crate::executor::{JobExecutor, JobFailure, JobOutcome, JobRequest, ServiceTarget};
use crate::ledger::{Ledger, TxReceipt};
use crate::metadata::{
    MetadataStore, Registry, ServiceGroup, ServiceMetadata, load_service_metadata,
};
use crate::options::JobOptions;
use crate::rpc::ServiceTransport;
use crate::selector::{ChannelSelector, ChannelTarget};
use crate::signer::Account;
use crate::state::ChannelStateClient;
use crate::units::{Address, Cogs};

/// Collaborators shared by every service client of one payer.
#[derive(Clone)]
pub struct SdkContext {
    pub ledger: Arc<dyn Ledger>,
    pub account: Arc<Account>,
    pub transport: Arc<dyn ServiceTransport>,
    pub state_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balances {
    pub address: Address,
    pub escrow: Cogs,
    pub tokens: Cogs,
    pub allowance: Cogs,
}

pub struct ServiceClient {
    context: SdkContext,
    state_client: ChannelStateClient,
    metadata: ServiceMetadata,
    group: ServiceGroup,
    target: ServiceTarget,
    default_options: JobOptions,
    parent_span: Span,
}

impl ServiceClient {
    pub fn new(
        context: SdkContext,
        metadata: ServiceMetadata,
        group_name: Option<&str>,
    ) -> Result<Self, PaymentError> {
        let contract = context.ledger.contract_address();
        if let Some(mpe_address) = metadata.mpe_address
            && mpe_address != contract
        {
            return Err(PaymentError::InvalidServiceMetadata(format!(
                "service pays through escrow contract {mpe_address}, ledger is bound to {contract}"
            )));
        }
        let group = metadata.group(group_name)?.clone();
        let target = ServiceTarget {
            channel: ChannelTarget {
                recipient: group.payment.payment_address,
                group_id: group.group_id,
                endpoint: group.first_endpoint()?.to_string(),
            },
            price: group.fixed_price()?,
            expiration_threshold: group.payment.payment_expiration_threshold,
        };
        let state_client =
            ChannelStateClient::new(context.account.clone(), context.state_timeout_ms);
        Ok(Self {
            context,
            state_client,
            metadata,
            group,
            target,
            default_options: JobOptions::default(),
            parent_span: Span::current(),
        })
    }

    /// Builds a client from registry and metadata store lookups.
    pub async fn resolve(
        context: SdkContext,
        registry: &dyn Registry,
        store: &dyn MetadataStore,
        org_id: &str,
        service_id: &str,
        group_name: Option<&str>,
    ) -> Result<Self, PaymentError> {
        let metadata = load_service_metadata(registry, store, org_id, service_id).await?;
        tracing::debug!(
            org_id,
            service_id,
            groups = metadata.groups.len(),
            "loaded service metadata"
        );
        Self::new(context, metadata, group_name)
    }

    #[must_use]
    pub fn with_default_options(mut self, options: JobOptions) -> Self {
        self.default_options = options;
        self
    }

    #[must_use]
    pub fn with_parent_span(mut self, span: Span) -> Self {
        self.parent_span = span;
        self
    }

    #[must_use]
    pub fn metadata(&self) -> &ServiceMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn group(&self) -> &ServiceGroup {
        &self.group
    }

    #[must_use]
    pub fn target(&self) -> &ServiceTarget {
        &self.target
    }

    #[must_use]
    pub fn executor(&self) -> JobExecutor {
        JobExecutor::new(
            self.context.ledger.clone(),
            self.context.account.clone(),
            self.state_client.clone(),
            self.context.transport.clone(),
            self.target.clone(),
            self.default_options.clone(),
        )
        .with_parent_span(self.parent_span.clone())
    }

    pub async fn run_job(&self, request: JobRequest) -> Result<JobOutcome, JobFailure> {
        self.executor().run(request).await
    }

    pub async fn run_job_with_observer(
        &self,
        request: JobRequest,
        observer: UnboundedSender<JobEvent>,
    ) -> Result<JobOutcome, JobFailure> {
        self.executor().with_observer(observer).run(request).await
    }

    /// Payer's channels to this group, ordered by id.
    pub async fn list_channels(&self) -> Result<Vec<PaymentChannel>, PaymentError> {
        let selector =
            ChannelSelector::new(self.context.ledger.clone(), self.context.account.clone());
        let mut ids: Vec<u64> = selector
            .available_channels(&self.target.channel)
            .await?
            .into_iter()
            .map(|event| event.channel_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let mut channels = Vec::with_capacity(ids.len());
        for channel_id in ids {
            channels.push(self.load_channel(channel_id).await?);
        }
        Ok(channels)
    }

    pub async fn channel_state(
        &self,
        channel_id: u64,
    ) -> Result<(PaymentChannel, ChannelState), PaymentError> {
        let channel = self.load_channel(channel_id).await?;
        let state = self.state_client.channel_state(&channel).await?;
        Ok((channel, state))
    }

    /// Reclaims the unspent value of an expired channel into escrow.
    pub async fn claim_timeout(&self, channel_id: u64) -> Result<TxReceipt, PaymentError> {
        let channel = self.load_channel(channel_id).await?;
        let current_block = self.context.ledger.current_block().await?;
        if !channel.is_expired_at(current_block) {
            return Err(PaymentError::ChannelNotExpired {
                channel_id,
                expiration: channel.expiration,
                current_block,
            });
        }
        let receipt = self.context.ledger.channel_claim_timeout(channel_id).await?;
        tracing::info!(
            channel_id,
            tx_hash = %receipt.tx_hash,
            value_cogs = %channel.value,
            "claimed expired channel"
        );
        Ok(receipt)
    }

    pub async fn balances(&self) -> Result<Balances, PaymentError> {
        account_balances(self.context.ledger.as_ref(), &self.context.account.address()).await
    }

    async fn load_channel(&self, channel_id: u64) -> Result<PaymentChannel, PaymentError> {
        PaymentChannel::load(
            self.context.ledger.as_ref(),
            channel_id,
            self.target.channel.endpoint.clone(),
        )
        .await
    }
}

pub async fn account_balances(
    ledger: &dyn Ledger,
    address: &Address,
) -> Result<Balances, PaymentError> {
    Ok(Balances {
        address: *address,
        escrow: ledger.escrow_balance(address).await?,
        tokens: ledger.token_balance(address).await?,
        allowance: ledger.token_allowance(address).await?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{SdkContext, ServiceClient};
    use crate::error::PaymentError;
    use crate::ledger::InMemoryLedger;
    use crate::metadata::ServiceMetadata;
    use crate::rpc::HttpJsonTransport;
    use crate::signer::Account;
    use crate::units::{Address, Cogs, GroupId};

    const CONTRACT: [u8; 20] = [9; 20];
    const PAYER: [u8; 20] = [1; 20];

    fn metadata(mpe_address: Option<&str>) -> Result<ServiceMetadata, serde_json::Error> {
        serde_json::from_value(json!({
            "display_name": "Example Calculator",
            "mpe_address": mpe_address,
            "groups": [{
                "group_name": "default_group",
                "group_id": "BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc=",
                "pricing": [{ "price_model": "fixed_price", "price_in_cogs": 3, "default": true }],
                "endpoints": ["http://127.0.0.1:9"],
                "payment": {
                    "payment_address": "0x0202020202020202020202020202020202020202",
                    "payment_expiration_threshold": 100
                }
            }]
        }))
    }

    fn context(ledger: Arc<InMemoryLedger>) -> SdkContext {
        SdkContext {
            ledger,
            account: Arc::new(Account::watch_only(Address::from_bytes(PAYER))),
            transport: Arc::new(HttpJsonTransport::default()),
            state_timeout_ms: 1_000,
        }
    }

    #[test]
    fn target_comes_from_the_chosen_group() -> Result<(), Box<dyn std::error::Error>> {
        let ledger = Arc::new(InMemoryLedger::new(
            Address::from_bytes(CONTRACT),
            Address::from_bytes(PAYER),
            10,
        ));
        let client = ServiceClient::new(context(ledger), metadata(None)?, None)?;
        let target = client.target();
        assert_eq!(target.price, Cogs::new(3));
        assert_eq!(target.expiration_threshold, 100);
        assert_eq!(target.channel.group_id, GroupId::from_bytes([7; 32]));
        assert_eq!(target.channel.recipient, Address::from_bytes([2; 20]));
        Ok(())
    }

    #[test]
    fn mismatched_escrow_contract_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let ledger = Arc::new(InMemoryLedger::new(
            Address::from_bytes(CONTRACT),
            Address::from_bytes(PAYER),
            10,
        ));
        let result = ServiceClient::new(
            context(ledger),
            metadata(Some("0x0303030303030303030303030303030303030303"))?,
            None,
        );
        assert!(matches!(
            result,
            Err(PaymentError::InvalidServiceMetadata(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn channel_utilities_list_and_claim() -> Result<(), Box<dyn std::error::Error>> {
        let payer = Address::from_bytes(PAYER);
        let ledger = Arc::new(InMemoryLedger::new(Address::from_bytes(CONTRACT), payer, 10));
        let recipient = Address::from_bytes([2; 20]);
        let group = GroupId::from_bytes([7; 32]);
        let older = ledger.insert_channel(recipient, group, Cogs::new(40), 50)?;
        let newer = ledger.insert_channel(recipient, group, Cogs::new(60), 20)?;
        ledger.insert_channel(recipient, GroupId::from_bytes([8; 32]), Cogs::new(1), 20)?;

        let client = ServiceClient::new(context(ledger.clone()), metadata(None)?, None)?;
        let ids: Vec<u64> = client
            .list_channels()
            .await?
            .iter()
            .map(|channel| channel.channel_id)
            .collect();
        assert_eq!(ids, vec![older, newer]);

        assert!(matches!(
            client.claim_timeout(newer).await,
            Err(PaymentError::ChannelNotExpired { .. })
        ));
        ledger.set_block(21)?;
        client.claim_timeout(newer).await?;
        let balances = client.balances().await?;
        assert_eq!(balances.escrow, Cogs::new(60));
        assert_eq!(ledger.operations()?, vec!["channel_claim_timeout".to_string()]);
        Ok(())
    }
}
