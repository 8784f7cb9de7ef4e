use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ChannelState, PaymentChannel};
use crate::error::PaymentError;
use crate::signer::Account;
use crate::units::{Cogs, decode_be_u64, encode_channel_id};
use crate::wire::{
    CHANNEL_STATE_METHOD, CHANNEL_STATE_SERVICE, ChannelStateReply, ChannelStateRequest,
    GRPC_WEB_CONTENT_TYPE, decode_message, encode_message,
};

pub const DEFAULT_STATE_TIMEOUT_MS: u64 = 10_000;

/// Authenticated query for the daemon's last accepted voucher.
///
/// Read-only and idempotent; callers may retry freely.
#[derive(Debug, Clone)]
pub struct ChannelStateClient {
    account: Arc<Account>,
    timeout: Duration,
    http: reqwest::Client,
}

impl ChannelStateClient {
    #[must_use]
    pub fn new(account: Arc<Account>, timeout_ms: u64) -> Self {
        Self {
            account,
            timeout: Duration::from_millis(timeout_ms.max(100)),
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn endpoint_url(endpoint: &str) -> String {
        format!(
            "{}/{CHANNEL_STATE_SERVICE}/{CHANNEL_STATE_METHOD}",
            endpoint.trim().trim_end_matches('/')
        )
    }

    pub async fn channel_state(
        &self,
        channel: &PaymentChannel,
    ) -> Result<ChannelState, PaymentError> {
        let channel_id = channel.channel_id;
        let signature = self.account.sign_channel_id(channel_id)?;
        let request = ChannelStateRequest {
            channel_id: encode_channel_id(channel_id)?.to_vec(),
            signature: signature.as_bytes().to_vec(),
        };

        let unavailable = |message: String| PaymentError::ChannelStateUnavailable {
            channel_id,
            message,
        };
        let response = self
            .http
            .post(Self::endpoint_url(&channel.endpoint))
            .header(reqwest::header::CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
            .header("x-grpc-web", "1")
            .timeout(self.timeout)
            .body(encode_message(&request))
            .send()
            .await
            .map_err(|error| unavailable(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("http status {status}")));
        }
        if let Some(grpc_status) = response
            .headers()
            .get("grpc-status")
            .and_then(|value| value.to_str().ok())
            .filter(|value| *value != "0")
        {
            let message = response
                .headers()
                .get("grpc-message")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            return Err(unavailable(format!("grpc-status {grpc_status}: {message}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|error| unavailable(error.to_string()))?;
        let state = parse_reply(channel_id, &body)?;
        tracing::debug!(
            channel_id,
            nonce = state.current_nonce,
            signed_amount = %state.current_signed_amount,
            "fetched channel state"
        );
        Ok(state)
    }
}

fn parse_reply(channel_id: u64, body: &[u8]) -> Result<ChannelState, PaymentError> {
    let malformed = |message: String| PaymentError::ChannelStateMalformed {
        channel_id,
        message,
    };
    let reply: ChannelStateReply =
        decode_message(body).map_err(|error| malformed(error.to_string()))?;
    let current_nonce = decode_be_u64(&reply.current_nonce)
        .map_err(|error| malformed(format!("current_nonce: {error}")))?;
    let current_signed_amount = Cogs::from_be_slice(&reply.current_signed_amount)
        .map_err(|error| malformed(format!("current_signed_amount: {error}")))?;
    Ok(ChannelState {
        channel_id,
        current_nonce,
        current_signed_amount,
        current_signature: reply.current_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::{ChannelStateClient, parse_reply};
    use crate::error::PaymentError;
    use crate::units::Cogs;
    use crate::wire::{ChannelStateReply, encode_frame, encode_message};

    #[test]
    fn endpoint_url_targets_state_service() {
        assert_eq!(
            ChannelStateClient::endpoint_url("http://daemon:7000/"),
            "http://daemon:7000/escrow.PaymentChannelStateService/GetChannelState"
        );
    }

    #[test]
    fn reply_fields_decode_as_big_endian_integers() -> Result<(), PaymentError> {
        let body = encode_message(&ChannelStateReply {
            current_nonce: vec![0, 2],
            current_signed_amount: vec![0x01, 0xf4],
            current_signature: vec![1; 65],
        });
        let state = parse_reply(7, &body)?;
        assert_eq!(state.current_nonce, 2);
        assert_eq!(state.current_signed_amount, Cogs::new(500));
        assert_eq!(state.current_signature.len(), 65);
        Ok(())
    }

    #[test]
    fn empty_reply_means_nothing_signed_yet() -> Result<(), PaymentError> {
        let state = parse_reply(7, &encode_message(&ChannelStateReply::default()))?;
        assert_eq!(state.current_nonce, 0);
        assert_eq!(state.current_signed_amount, Cogs::ZERO);
        Ok(())
    }

    #[test]
    fn garbage_reply_is_malformed() {
        let result = parse_reply(7, &encode_frame(&[0xff, 0xff, 0xff]));
        assert!(matches!(
            result,
            Err(PaymentError::ChannelStateMalformed { channel_id: 7, .. })
        ));
        let result = parse_reply(7, &[0, 0]);
        assert!(matches!(
            result,
            Err(PaymentError::ChannelStateMalformed { .. })
        ));
    }
}
