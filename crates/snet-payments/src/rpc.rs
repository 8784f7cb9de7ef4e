//! Remote paid call seam: method naming, payment headers, and a JSON-over-HTTP
//! transport.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::signer::RecoverableSignature;
use crate::units::Cogs;

pub const HEADER_PAYMENT_TYPE: &str = "snet-payment-type";
pub const HEADER_CHANNEL_ID: &str = "snet-payment-channel-id";
pub const HEADER_CHANNEL_NONCE: &str = "snet-payment-channel-nonce";
pub const HEADER_CHANNEL_AMOUNT: &str = "snet-payment-channel-amount";
pub const HEADER_CHANNEL_SIGNATURE: &str = "snet-payment-channel-signature-bin";
pub const PAYMENT_TYPE_ESCROW: &str = "escrow";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid method name `{0}`")]
    InvalidMethod(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid payment metadata: {0}")]
    InvalidMetadata(String),
}

/// Fully qualified remote method, `package.Service/method`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodName {
    pub package: Option<String>,
    pub service: String,
    pub method: String,
}

impl MethodName {
    /// Request path relative to the service endpoint.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/{self}")
    }
}

impl FromStr for MethodName {
    type Err = TransportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_start_matches('/');
        let invalid = || TransportError::InvalidMethod(value.to_string());
        let (qualified, method) = trimmed.split_once('/').ok_or_else(invalid)?;
        if method.is_empty() || method.contains('/') || qualified.is_empty() {
            return Err(invalid());
        }
        let (package, service) = match qualified.rsplit_once('.') {
            Some((package, service)) if !package.is_empty() && !service.is_empty() => {
                (Some(package.to_string()), service.to_string())
            }
            Some(_) => return Err(invalid()),
            None => (None, qualified.to_string()),
        };
        Ok(Self {
            package,
            service,
            method: method.to_string(),
        })
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}.{}/{}", self.service, self.method),
            None => write!(f, "{}/{}", self.service, self.method),
        }
    }
}

/// Voucher attached to a paid call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMetadata {
    pub channel_id: u64,
    pub nonce: u64,
    pub amount: Cogs,
    pub signature: RecoverableSignature,
}

impl PaymentMetadata {
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_PAYMENT_TYPE, PAYMENT_TYPE_ESCROW.to_string()),
            (HEADER_CHANNEL_ID, self.channel_id.to_string()),
            (HEADER_CHANNEL_NONCE, self.nonce.to_string()),
            (HEADER_CHANNEL_AMOUNT, self.amount.to_string()),
            (HEADER_CHANNEL_SIGNATURE, self.signature.to_base64()),
        ]
    }

    /// Parses the headers a service daemon receives.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, TransportError> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .ok_or_else(|| TransportError::InvalidMetadata(format!("missing {name}")))
        };
        let malformed =
            |name: &str| TransportError::InvalidMetadata(format!("malformed {name}"));

        if get(HEADER_PAYMENT_TYPE)? != PAYMENT_TYPE_ESCROW {
            return Err(malformed(HEADER_PAYMENT_TYPE));
        }
        let channel_id = get(HEADER_CHANNEL_ID)?
            .parse::<u64>()
            .map_err(|_| malformed(HEADER_CHANNEL_ID))?;
        let nonce = get(HEADER_CHANNEL_NONCE)?
            .parse::<u64>()
            .map_err(|_| malformed(HEADER_CHANNEL_NONCE))?;
        let amount = get(HEADER_CHANNEL_AMOUNT)?
            .parse::<u128>()
            .map(Cogs::new)
            .map_err(|_| malformed(HEADER_CHANNEL_AMOUNT))?;
        let raw = STANDARD
            .decode(get(HEADER_CHANNEL_SIGNATURE)?)
            .map_err(|_| malformed(HEADER_CHANNEL_SIGNATURE))?;
        let signature = RecoverableSignature::from_slice(&raw)
            .map_err(|_| malformed(HEADER_CHANNEL_SIGNATURE))?;
        Ok(Self {
            channel_id,
            nonce,
            amount,
            signature,
        })
    }
}

/// Dispatches a paid call to a service endpoint.
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &str,
        method: &MethodName,
        request: &Value,
        metadata: &PaymentMetadata,
    ) -> Result<Value, TransportError>;
}

/// JSON request/response transport; payment metadata travels as headers.
#[derive(Debug, Clone)]
pub struct HttpJsonTransport {
    timeout: Option<Duration>,
    http: reqwest::Client,
}

impl Default for HttpJsonTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HttpJsonTransport {
    #[must_use]
    pub fn new(timeout_ms: Option<u64>) -> Self {
        Self {
            timeout: timeout_ms.map(Duration::from_millis),
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn url(endpoint: &str, method: &MethodName) -> String {
        format!("{}{}", endpoint.trim().trim_end_matches('/'), method.path())
    }
}

#[async_trait]
impl ServiceTransport for HttpJsonTransport {
    async fn invoke(
        &self,
        endpoint: &str,
        method: &MethodName,
        request: &Value,
        metadata: &PaymentMetadata,
    ) -> Result<Value, TransportError> {
        let mut builder = self.http.post(Self::url(endpoint, method)).json(request);
        for (name, value) in metadata.headers() {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| TransportError::Transport(error.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|error| TransportError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(|error| TransportError::Decode(error.to_string()))
    }
}
