//! Escrow payment channels and paid job execution for SingularityNET-style
//! services.
//!
//! A job resolves a payment channel to the service's payment group, brings
//! its funding and expiration up to policy, signs a cumulative voucher and
//! attaches it to the remote call. Every step is recorded in a [`JobEventLog`].

pub mod channel;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod metadata;
pub mod options;
pub mod rpc;
pub mod selector;
pub mod service;
pub mod signer;
pub mod stabilizer;
pub mod state;
pub mod units;
pub mod wire;

pub use channel::{ChannelState, PaymentChannel};
pub use config::{ConfigError, SdkConfig, ServiceEntry};
pub use error::{ChannelDefect, DefectDetail, PaymentError};
pub use events::{JobEvent, JobEventLog, JobStage};
pub use executor::{
    JobExecutor, JobFailure, JobOutcome, JobRequest, JobState, JobStats, JobSummary,
    ServiceTarget,
};
pub use ledger::{
    FundingOperation, FundingReceipt, HttpLedgerGateway, HttpLedgerGatewayConfig, InMemoryLedger,
    Ledger, LedgerError, TxReceipt,
};
pub use metadata::{
    HttpMetadataStore, MetadataError, MetadataStore, Registry, ServiceMetadata, StaticRegistry,
};
pub use options::{JobOptions, ResolvedJobOptions};
pub use rpc::{HttpJsonTransport, MethodName, PaymentMetadata, ServiceTransport, TransportError};
pub use selector::{ChannelSelector, ChannelTarget};
pub use service::{Balances, SdkContext, ServiceClient};
pub use signer::{Account, RecoverableSignature};
pub use stabilizer::{ChannelStabilizer, ChannelValidity};
pub use state::ChannelStateClient;
pub use units::{Address, Cogs, GroupId};
