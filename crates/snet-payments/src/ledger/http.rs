use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    ChannelFilter, ChannelInfo, ChannelOpenEvent, Ledger, LedgerError, OpenChannelRequest,
    OpenedChannel, TxReceipt,
};
use crate::units::{Address, Cogs};

pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_READ_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct HttpLedgerGatewayConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub contract_address: Address,
    /// Covers confirmation latency of write operations.
    pub timeout_ms: u64,
    /// Attempts for idempotent reads. Writes are always attempted once.
    pub read_attempts: usize,
}

impl HttpLedgerGatewayConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>, contract_address: Address) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            contract_address,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            read_attempts: DEFAULT_READ_ATTEMPTS,
        }
    }
}

/// JSON-over-HTTP client for a ledger gateway that holds the payer's
/// transaction key and waits for confirmation before replying.
#[derive(Debug, Clone)]
pub struct HttpLedgerGateway {
    base_url: String,
    auth_token: Option<String>,
    contract_address: Address,
    timeout: Duration,
    read_attempts: usize,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorEnvelope {
    error: GatewayErrorBody,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    block_number: u64,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Cogs,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    events: Vec<ChannelOpenEvent>,
}

#[derive(Debug, Serialize)]
struct FundingBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    expiration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<Cogs>,
}

#[derive(Debug, Serialize)]
struct AmountBody {
    amount: Cogs,
}

impl HttpLedgerGateway {
    pub fn new(config: HttpLedgerGatewayConfig) -> Result<Self, LedgerError> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(LedgerError::Transport(
                "ledger gateway base url is required".to_string(),
            ));
        }
        Ok(Self {
            base_url,
            auth_token: config
                .auth_token
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            contract_address: config.contract_address,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            read_attempts: config.read_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn channel_path(channel_id: u64) -> String {
        format!("/v1/channels/{channel_id}")
    }

    #[must_use]
    pub fn account_path(owner: &Address, resource: &str) -> String {
        format!("/v1/accounts/{owner}/{resource}")
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.timeout);
        if let Some(token) = self.auth_token.as_ref() {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        request
    }

    async fn get_json<T>(&self, path: &str) -> Result<Option<T>, LedgerError>
    where
        T: DeserializeOwned,
    {
        let mut last_error: Option<String> = None;
        for attempt in 0..self.read_attempts {
            match self.request(reqwest::Method::GET, path).send().await {
                Ok(response) => {
                    if response.status() == reqwest::StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    return decode_response(response).await.map(Some);
                }
                Err(error) => {
                    tracing::debug!(path, attempt, error = %error, "ledger gateway read failed");
                    last_error = Some(error.to_string());
                }
            }
        }
        Err(LedgerError::Transport(
            last_error.unwrap_or_else(|| "unknown".to_string()),
        ))
    }

    async fn get_required<T>(&self, path: &str) -> Result<T, LedgerError>
    where
        T: DeserializeOwned,
    {
        self.get_json(path).await?.ok_or_else(|| LedgerError::Api {
            status: 404,
            code: "not_found".to_string(),
            message: path.to_string(),
        })
    }

    async fn post_json<Req, Res>(&self, path: &str, body: &Req) -> Result<Res, LedgerError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|error| LedgerError::Transport(error.to_string()))?;
        decode_response(response).await
    }
}

async fn decode_response<T>(response: reqwest::Response) -> Result<T, LedgerError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|error| LedgerError::Transport(error.to_string()))?;
    if !status.is_success() {
        return Err(map_error_body(status.as_u16(), &body));
    }
    serde_json::from_slice(&body).map_err(|error| LedgerError::Parse(error.to_string()))
}

fn map_error_body(status: u16, body: &[u8]) -> LedgerError {
    if let Ok(parsed) = serde_json::from_slice::<GatewayErrorEnvelope>(body) {
        if parsed.error.code == "reverted" {
            return LedgerError::Reverted {
                tx_hash: parsed.error.tx_hash.unwrap_or_default(),
                reason: parsed.error.message,
            };
        }
        return LedgerError::Api {
            status,
            code: parsed.error.code,
            message: parsed.error.message,
        };
    }
    LedgerError::Api {
        status,
        code: "ledger_gateway_error".to_string(),
        message: String::from_utf8_lossy(body).to_string(),
    }
}

#[async_trait]
impl Ledger for HttpLedgerGateway {
    fn contract_address(&self) -> Address {
        self.contract_address
    }

    async fn current_block(&self) -> Result<u64, LedgerError> {
        let response: BlockResponse = self.get_required("/v1/blocks/current").await?;
        Ok(response.block_number)
    }

    async fn channel(&self, channel_id: u64) -> Result<Option<ChannelInfo>, LedgerError> {
        self.get_json(Self::channel_path(channel_id).as_str()).await
    }

    async fn open_channel_events(
        &self,
        filter: &ChannelFilter,
    ) -> Result<Vec<ChannelOpenEvent>, LedgerError> {
        let response: EventsResponse = self.post_json("/v1/events/channel-open", filter).await?;
        Ok(response.events)
    }

    async fn open_channel(
        &self,
        request: &OpenChannelRequest,
    ) -> Result<OpenedChannel, LedgerError> {
        self.post_json("/v1/channels", request).await
    }

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: u64,
        expiration: u64,
        amount: Cogs,
    ) -> Result<TxReceipt, LedgerError> {
        let path = format!("{}/extend-and-add-funds", Self::channel_path(channel_id));
        self.post_json(
            path.as_str(),
            &FundingBody {
                expiration: Some(expiration),
                amount: Some(amount),
            },
        )
        .await
    }

    async fn channel_add_funds(
        &self,
        channel_id: u64,
        amount: Cogs,
    ) -> Result<TxReceipt, LedgerError> {
        let path = format!("{}/add-funds", Self::channel_path(channel_id));
        self.post_json(
            path.as_str(),
            &FundingBody {
                expiration: None,
                amount: Some(amount),
            },
        )
        .await
    }

    async fn channel_extend(
        &self,
        channel_id: u64,
        expiration: u64,
    ) -> Result<TxReceipt, LedgerError> {
        let path = format!("{}/extend", Self::channel_path(channel_id));
        self.post_json(
            path.as_str(),
            &FundingBody {
                expiration: Some(expiration),
                amount: None,
            },
        )
        .await
    }

    async fn channel_claim_timeout(&self, channel_id: u64) -> Result<TxReceipt, LedgerError> {
        let path = format!("{}/claim-timeout", Self::channel_path(channel_id));
        self.post_json(path.as_str(), &serde_json::json!({})).await
    }

    async fn escrow_balance(&self, owner: &Address) -> Result<Cogs, LedgerError> {
        let response: BalanceResponse = self
            .get_required(Self::account_path(owner, "escrow").as_str())
            .await?;
        Ok(response.balance)
    }

    async fn token_balance(&self, owner: &Address) -> Result<Cogs, LedgerError> {
        let response: BalanceResponse = self
            .get_required(Self::account_path(owner, "token").as_str())
            .await?;
        Ok(response.balance)
    }

    async fn token_allowance(&self, owner: &Address) -> Result<Cogs, LedgerError> {
        let response: BalanceResponse = self
            .get_required(Self::account_path(owner, "allowance").as_str())
            .await?;
        Ok(response.balance)
    }

    async fn approve_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError> {
        self.post_json("/v1/escrow/approve", &AmountBody { amount })
            .await
    }

    async fn deposit_to_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError> {
        self.post_json("/v1/escrow/deposit", &AmountBody { amount })
            .await
    }

    async fn withdraw_from_escrow(&self, amount: Cogs) -> Result<TxReceipt, LedgerError> {
        self.post_json("/v1/escrow/withdraw", &AmountBody { amount })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::sync::{Mutex, oneshot};

    use super::{HttpLedgerGateway, HttpLedgerGatewayConfig, map_error_body};
    use crate::ledger::{Ledger, LedgerError};
    use crate::units::{Address, Cogs};

    #[derive(Clone, Default)]
    struct StubState {
        calls: Arc<Mutex<Vec<String>>>,
    }

    struct GatewayStub {
        base_url: String,
        calls: Arc<Mutex<Vec<String>>>,
        shutdown: Option<oneshot::Sender<()>>,
    }

    impl GatewayStub {
        async fn stop(mut self) {
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }

    async fn spawn_gateway_stub() -> Result<GatewayStub> {
        let state = StubState::default();
        let calls = state.calls.clone();
        let app = Router::new()
            .route("/v1/blocks/current", get(current_block))
            .route("/v1/channels/:id", get(channel))
            .route("/v1/channels/:id/add-funds", post(add_funds))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(GatewayStub {
            base_url: format!("http://{addr}"),
            calls,
            shutdown: Some(shutdown_tx),
        })
    }

    async fn current_block(State(state): State<StubState>, headers: HeaderMap) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        state.calls.lock().await.push(format!("current_block:{auth}"));
        Json(json!({ "block_number": 4242 }))
    }

    async fn channel(Path(id): Path<u64>) -> impl IntoResponse {
        if id != 7 {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": {"code": "not_found", "message": "no channel"}})),
            )
                .into_response();
        }
        Json(json!({
            "channel_id": 7,
            "nonce": 2,
            "sender": "0x0000000000000000000000000000000000000001",
            "signer": "0x0000000000000000000000000000000000000001",
            "recipient": "0x0000000000000000000000000000000000000002",
            "group_id": "m5FKWq4hW0foGW5qSbzGSjgZRuKs7A1ZwbIrJ9e96rc=",
            "value": "1000",
            "expiration": 5000
        }))
        .into_response()
    }

    async fn add_funds(
        State(state): State<StubState>,
        Path(id): Path<u64>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        state
            .calls
            .lock()
            .await
            .push(format!("add_funds:{id}:{}", body["amount"]));
        (
            StatusCode::CONFLICT,
            Json(json!({
                "error": {"code": "reverted", "message": "insufficient escrow", "tx_hash": "0xabc"}
            })),
        )
    }

    fn gateway(base_url: &str) -> Result<HttpLedgerGateway> {
        let mut config = HttpLedgerGatewayConfig::new(base_url, Address::from_bytes([9; 20]));
        config.auth_token = Some(" token-1 ".to_string());
        Ok(HttpLedgerGateway::new(config)?)
    }

    #[tokio::test]
    async fn reads_decode_channels_and_treat_404_as_missing() -> Result<()> {
        let stub = spawn_gateway_stub().await?;
        let gateway = gateway(&stub.base_url)?;

        assert_eq!(gateway.current_block().await?, 4242);
        let channel = gateway.channel(7).await?;
        assert_eq!(channel.map(|c| (c.nonce, c.value)), Some((2, Cogs::new(1000))));
        assert!(gateway.channel(8).await?.is_none());

        let calls = stub.calls.lock().await.clone();
        assert_eq!(calls, vec!["current_block:Bearer token-1".to_string()]);
        stub.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn reverted_writes_surface_tx_hash() -> Result<()> {
        let stub = spawn_gateway_stub().await?;
        let gateway = gateway(&stub.base_url)?;

        let result = gateway.channel_add_funds(7, Cogs::new(500)).await;
        match result {
            Err(LedgerError::Reverted { tx_hash, reason }) => {
                assert_eq!(tx_hash, "0xabc");
                assert_eq!(reason, "insufficient escrow");
            }
            other => assert!(false, "unexpected result: {other:?}"),
        }
        let calls = stub.calls.lock().await.clone();
        assert_eq!(calls, vec!["add_funds:7:\"500\"".to_string()]);
        stub.stop().await;
        Ok(())
    }

    #[test]
    fn unstructured_error_bodies_keep_their_text() {
        let error = map_error_body(502, b"bad gateway");
        assert!(matches!(
            error,
            LedgerError::Api { status: 502, ref message, .. } if message == "bad gateway"
        ));
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let config = HttpLedgerGatewayConfig::new("  ", Address::default());
        assert!(HttpLedgerGateway::new(config).is_err());
    }
}
