use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use snet_payments::{
    Account, Cogs, ConfigError, HttpJsonTransport, HttpLedgerGateway, HttpLedgerGatewayConfig,
    HttpMetadataStore, InMemoryLedger, Ledger, SdkConfig, SdkContext, ServiceClient,
};

use crate::SnetCli;

/// Service selection shared by the job and channel commands.
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Organization id
    pub org_id: String,
    /// Service id
    pub service_id: String,
    /// Payment group (defaults to the configured group, then the first one)
    #[arg(long)]
    pub group: Option<String>,
}

pub struct CliContext {
    pub config: SdkConfig,
    pub json: bool,
    dry_run: bool,
    dry_run_tokens: Cogs,
}

impl CliContext {
    pub fn load(cli: &SnetCli) -> Result<Self> {
        let (config, config_path) = SdkConfig::load(cli.config.as_deref())?;
        match &config_path {
            Some(path) => tracing::debug!(path = %path.display(), "loaded config"),
            None => tracing::debug!("no config file found, using defaults"),
        }
        Ok(Self {
            config,
            json: cli.json,
            dry_run: cli.dry_run,
            dry_run_tokens: cli.dry_run_tokens.unwrap_or(Cogs::ZERO),
        })
    }

    pub fn account(&self) -> Result<Arc<Account>> {
        let key = self
            .config
            .private_key
            .as_deref()
            .ok_or(ConfigError::Missing("SNET_PRIVATE_KEY"))?;
        Ok(Arc::new(Account::from_private_key_hex(key)?))
    }

    pub fn ledger(&self, account: &Account) -> Result<Arc<dyn Ledger>> {
        let contract = self
            .config
            .mpe_contract_address
            .ok_or(ConfigError::Missing("mpe_contract_address"))?;
        if self.dry_run {
            let ledger = InMemoryLedger::new(contract, account.address(), 0);
            ledger.credit_tokens(account.address(), self.dry_run_tokens)?;
            tracing::info!(tokens_cogs = %self.dry_run_tokens, "using in-memory ledger");
            return Ok(Arc::new(ledger));
        }

        let base_url = self
            .config
            .ledger_gateway_url
            .clone()
            .ok_or(ConfigError::Missing("ledger_gateway_url"))?;
        let mut gateway = HttpLedgerGatewayConfig::new(base_url, contract);
        gateway.auth_token.clone_from(&self.config.ledger_auth_token);
        Ok(Arc::new(HttpLedgerGateway::new(gateway)?))
    }

    pub fn sdk_context(&self) -> Result<SdkContext> {
        let account = self.account()?;
        let ledger = self.ledger(&account)?;
        Ok(SdkContext {
            ledger,
            account,
            transport: Arc::new(HttpJsonTransport::default()),
            state_timeout_ms: self.config.state_timeout_ms,
        })
    }

    /// Resolves the service's metadata and builds a client for one group.
    pub async fn service_client(&self, service: &ServiceArgs) -> Result<ServiceClient> {
        let entry = self.config.service(&service.org_id, &service.service_id)?;
        let group = service.group.as_deref().or(entry.group_name.as_deref());
        let store = HttpMetadataStore::new(self.config.ipfs_gateway_url.clone());
        let client = ServiceClient::resolve(
            self.sdk_context()?,
            &self.config.registry(),
            &store,
            &service.org_id,
            &service.service_id,
            group,
        )
        .await
        .with_context(|| format!("resolve {}/{}", service.org_id, service.service_id))?;
        Ok(client.with_default_options(self.config.job.clone()))
    }
}

/// Parses a decimal AGI amount into cogs.
pub fn parse_agi(raw: &str) -> Result<Cogs, String> {
    Cogs::from_agi_str(raw).map_err(|error| error.to_string())
}
