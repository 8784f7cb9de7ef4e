//! One paid call, end to end: resolve a channel, bring it into compliance,
//! sign the voucher, invoke the service and summarize.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{Instrument, Span};

use crate::channel::{ChannelState, PaymentChannel};
use crate::error::PaymentError;
use crate::events::{JobEvent, JobEventLog, JobStage};
use crate::ledger::{FundingReceipt, Ledger};
use crate::options::{JobOptions, ResolvedJobOptions, resolve_amount, resolve_expiration};
use crate::rpc::{MethodName, PaymentMetadata, ServiceTransport};
use crate::selector::{ChannelSelection, ChannelSelector, ChannelTarget};
use crate::signer::Account;
use crate::stabilizer::{ChannelStabilizer, ChannelValidity};
use crate::state::ChannelStateClient;
use crate::units::Cogs;

/// Payment group terms a job runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub channel: ChannelTarget,
    pub price: Cogs,
    pub expiration_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub method: MethodName,
    pub request: Value,
    /// Channel to pay through instead of the selected one.
    pub channel_id: Option<u64>,
    /// Replaces the executor's default options for this run.
    pub options: Option<JobOptions>,
}

impl JobRequest {
    #[must_use]
    pub fn new(method: MethodName, request: Value) -> Self {
        Self {
            method,
            request,
            channel_id: None,
            options: None,
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel_id: u64) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    ResolvingChannel,
    Stabilizing,
    Signing,
    Invoking,
    Summarizing,
    Done,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResolvingChannel => "resolving_channel",
            Self::Stabilizing => "stabilizing",
            Self::Signing => "signing",
            Self::Invoking => "invoking",
            Self::Summarizing => "summarizing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Ledger footprint and balances after a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub channel_id: u64,
    pub nonce: u64,
    pub amount_signed: Cogs,
    pub price: Cogs,
    pub total_tx: usize,
    pub total_gas: u64,
    pub tx_hashes: Vec<String>,
    pub receipts: Vec<FundingReceipt>,
    pub channel_value: Cogs,
    pub channel_expiration: u64,
    pub escrow_balance: Cogs,
    pub token_balance: Cogs,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub method: String,
    pub request: Value,
    pub response: Value,
    pub is_new_channel: bool,
    pub stats: JobStats,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub response: Value,
    pub summary: JobSummary,
    pub events: Vec<JobEvent>,
}

/// Failed run with the events emitted up to the failure.
#[derive(Debug, thiserror::Error)]
#[error("job failed while {state}: {error}")]
pub struct JobFailure {
    pub state: JobState,
    #[source]
    pub error: PaymentError,
    pub events: Vec<JobEvent>,
}

impl JobFailure {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

/// Single-shot executor; `run` consumes it.
pub struct JobExecutor {
    ledger: Arc<dyn Ledger>,
    account: Arc<Account>,
    state_client: ChannelStateClient,
    transport: Arc<dyn ServiceTransport>,
    target: ServiceTarget,
    options: JobOptions,
    events: JobEventLog,
    state: JobState,
    parent_span: Span,
}

impl JobExecutor {
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        account: Arc<Account>,
        state_client: ChannelStateClient,
        transport: Arc<dyn ServiceTransport>,
        target: ServiceTarget,
        options: JobOptions,
    ) -> Self {
        Self {
            ledger,
            account,
            state_client,
            transport,
            target,
            options,
            events: JobEventLog::new(),
            state: JobState::ResolvingChannel,
            parent_span: Span::current(),
        }
    }

    #[must_use]
    pub fn with_parent_span(mut self, span: Span) -> Self {
        self.parent_span = span;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: UnboundedSender<JobEvent>) -> Self {
        self.events = JobEventLog::with_observer(observer);
        self
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    pub async fn run(mut self, request: JobRequest) -> Result<JobOutcome, JobFailure> {
        let span = tracing::info_span!(
            parent: &self.parent_span,
            "job",
            method = %request.method,
            channel_id = tracing::field::Empty,
        );
        let result = self.execute(&request, &span).instrument(span.clone()).await;
        match result {
            Ok(summary) => {
                self.state = JobState::Done;
                tracing::info!(
                    parent: &span,
                    total_tx = summary.stats.total_tx,
                    amount_cogs = %summary.stats.amount_signed,
                    "job completed"
                );
                Ok(JobOutcome {
                    response: summary.response.clone(),
                    summary,
                    events: self.events.into_events(),
                })
            }
            Err(error) => {
                let failed_in = self.state;
                self.state = JobState::Failed;
                tracing::warn!(
                    parent: &span,
                    state = %failed_in,
                    kind = error.kind(),
                    error = %error,
                    "job failed"
                );
                Err(JobFailure {
                    state: failed_in,
                    error,
                    events: self.events.into_events(),
                })
            }
        }
    }

    async fn execute(
        &mut self,
        request: &JobRequest,
        span: &Span,
    ) -> Result<JobSummary, PaymentError> {
        let options = request
            .options
            .clone()
            .unwrap_or_else(|| self.options.clone());
        let price = self.target.price;
        if !self.account.can_sign() {
            return Err(PaymentError::NoSigningKey);
        }

        self.state = JobState::ResolvingChannel;
        let current_block = self.ledger.current_block().await?;
        let expiration =
            resolve_expiration(&options, current_block, self.target.expiration_threshold)?;
        let selector = ChannelSelector::new(self.ledger.clone(), self.account.clone());
        let ChannelSelection {
            mut channel,
            is_new,
            mut receipts,
        } = selector
            .resolve(
                &self.target.channel,
                request.channel_id,
                &options,
                price,
                &expiration,
                &mut self.events,
            )
            .await?;
        span.record("channel_id", channel.channel_id);

        let (nonce, signed_amount) = if is_new {
            (channel.nonce, Cogs::ZERO)
        } else {
            self.state = JobState::Stabilizing;
            let remote = self.fetch_channel_state(&channel).await?;
            let (_, signed_amount) = remote.effective_for(&channel);
            let escrow_balance = self
                .ledger
                .escrow_balance(&self.account.address())
                .await?;
            let resolved = ResolvedJobOptions {
                autohandle_channel: options.autohandle_channel,
                autohandle_escrow: options.autohandle_escrow,
                expiration,
                amounts: resolve_amount(&options, signed_amount, price, escrow_balance)?,
            };
            let validity = ChannelValidity::check(&channel, &resolved);
            self.events.emit(
                JobStage::CheckedChannelValidity,
                json!({
                    "channel_id": channel.channel_id,
                    "valid": validity.is_valid(),
                    "defects": validity,
                    "thresholds": resolved,
                }),
            );
            let stabilizer = ChannelStabilizer::new(self.ledger.clone(), self.account.clone());
            receipts.extend(
                stabilizer
                    .stabilize(&mut channel, &validity, &resolved, &mut self.events)
                    .await?,
            );
            remote.effective_for(&channel)
        };

        self.state = JobState::Signing;
        let amount = price.saturating_add(signed_amount);
        let signature = self.account.sign_voucher(
            &self.ledger.contract_address(),
            channel.channel_id,
            nonce,
            amount,
        )?;
        let metadata = PaymentMetadata {
            channel_id: channel.channel_id,
            nonce,
            amount,
            signature,
        };
        tracing::debug!(
            channel_id = channel.channel_id,
            nonce,
            amount_cogs = %amount,
            "signed voucher"
        );

        self.state = JobState::Invoking;
        let response = self.invoke(&channel, request, &metadata).await?;

        self.state = JobState::Summarizing;
        let payer = self.account.address();
        let escrow_balance = self.ledger.escrow_balance(&payer).await?;
        let token_balance = self.ledger.token_balance(&payer).await?;
        let stats = JobStats {
            channel_id: channel.channel_id,
            nonce,
            amount_signed: amount,
            price,
            total_tx: receipts.len(),
            total_gas: receipts.iter().map(|entry| entry.receipt.gas_used).sum(),
            tx_hashes: receipts
                .iter()
                .map(|entry| entry.receipt.tx_hash.clone())
                .collect(),
            receipts,
            channel_value: channel.value,
            channel_expiration: channel.expiration,
            escrow_balance,
            token_balance,
        };
        self.events.emit(JobStage::Stats, json!(stats));
        Ok(JobSummary {
            method: request.method.to_string(),
            request: request.request.clone(),
            response,
            is_new_channel: is_new,
            stats,
        })
    }

    async fn fetch_channel_state(
        &mut self,
        channel: &PaymentChannel,
    ) -> Result<ChannelState, PaymentError> {
        self.events.emit(
            JobStage::RequestChannelState,
            json!({ "channel_id": channel.channel_id, "endpoint": channel.endpoint }),
        );
        let state = self.state_client.channel_state(channel).await?;
        self.events.emit(
            JobStage::ReplyChannelState,
            json!({
                "channel_id": state.channel_id,
                "current_nonce": state.current_nonce,
                "current_signed_amount": state.current_signed_amount,
            }),
        );
        Ok(state)
    }

    async fn invoke(
        &mut self,
        channel: &PaymentChannel,
        request: &JobRequest,
        metadata: &PaymentMetadata,
    ) -> Result<Value, PaymentError> {
        self.events.emit(
            JobStage::RequestSvcCall,
            json!({
                "method": request.method.to_string(),
                "request": request.request,
                "endpoint": channel.endpoint,
            }),
        );
        let response = self
            .transport
            .invoke(&channel.endpoint, &request.method, &request.request, metadata)
            .await
            .map_err(|error| PaymentError::ServiceCallError {
                method: request.method.to_string(),
                request: request.request.clone(),
                message: error.to_string(),
            })?;
        self.events.emit(JobStage::ReplySvcCall, response.clone());
        Ok(response)
    }
}
