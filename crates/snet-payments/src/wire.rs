//! Channel-state wire contract: protobuf messages and single-message framing.

use prost::Message;

pub const CHANNEL_STATE_SERVICE: &str = "escrow.PaymentChannelStateService";
pub const CHANNEL_STATE_METHOD: &str = "GetChannelState";
pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

const FRAME_HEADER_LEN: usize = 5;
const TRAILER_FLAG: u8 = 0x80;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelStateRequest {
    /// 4-byte big-endian channel id.
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    /// 65-byte signature over the channel id.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ChannelStateReply {
    #[prost(bytes = "vec", tag = "1")]
    pub current_nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub current_signed_amount: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub current_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame header truncated: {0} bytes")]
    TruncatedHeader(usize),
    #[error("frame payload truncated: declared {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },
    #[error("compressed frames are not supported")]
    Compressed,
    #[error("no data frame in response")]
    MissingData,
    #[error("protobuf decode failed: {0}")]
    Decode(String),
}

/// `[flag][len: u32 BE][payload]` with flag 0.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(0);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Returns the payload of the first data frame, skipping trailer frames.
pub fn decode_first_data_frame(body: &[u8]) -> Result<&[u8], FrameError> {
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TruncatedHeader(rest.len()));
        }
        let flag = rest[0];
        let declared = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let available = rest.len() - FRAME_HEADER_LEN;
        if declared > available {
            return Err(FrameError::TruncatedPayload {
                declared,
                available,
            });
        }
        let payload = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + declared];
        if flag & TRAILER_FLAG == 0 {
            if flag & 0x01 != 0 {
                return Err(FrameError::Compressed);
            }
            return Ok(payload);
        }
        rest = &rest[FRAME_HEADER_LEN + declared..];
    }
    Err(FrameError::MissingData)
}

pub fn encode_message<M: Message>(message: &M) -> Vec<u8> {
    encode_frame(&message.encode_to_vec())
}

pub fn decode_message<M: Message + Default>(body: &[u8]) -> Result<M, FrameError> {
    let payload = decode_first_data_frame(body)?;
    M::decode(payload).map_err(|error| FrameError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{
        ChannelStateReply, FrameError, decode_first_data_frame, decode_message, encode_frame,
        encode_message,
    };

    #[test]
    fn frame_header_is_flag_then_big_endian_length() {
        let framed = encode_frame(&[0xaa, 0xbb, 0xcc]);
        assert_eq!(framed, vec![0, 0, 0, 0, 3, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn trailer_frames_are_skipped() -> Result<(), FrameError> {
        let mut body = vec![0x80, 0, 0, 0, 2, b'o', b'k'];
        body.extend(encode_frame(&[1, 2]));
        assert_eq!(decode_first_data_frame(&body)?, &[1, 2]);
        Ok(())
    }

    #[test]
    fn truncated_or_empty_bodies_are_rejected() {
        assert_eq!(decode_first_data_frame(&[]), Err(FrameError::MissingData));
        assert_eq!(
            decode_first_data_frame(&[0, 0, 0]),
            Err(FrameError::TruncatedHeader(3))
        );
        assert_eq!(
            decode_first_data_frame(&[0, 0, 0, 0, 9, 1]),
            Err(FrameError::TruncatedPayload {
                declared: 9,
                available: 1
            })
        );
        assert_eq!(
            decode_first_data_frame(&[1, 0, 0, 0, 0]),
            Err(FrameError::Compressed)
        );
    }

    #[test]
    fn reply_survives_framing() -> Result<(), FrameError> {
        let reply = ChannelStateReply {
            current_nonce: vec![2],
            current_signed_amount: vec![0x01, 0xf4],
            current_signature: vec![7; 65],
        };
        let decoded: ChannelStateReply = decode_message(&encode_message(&reply))?;
        assert_eq!(decoded, reply);
        Ok(())
    }
}
