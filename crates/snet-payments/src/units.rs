//! Fixed-point currency amounts, ledger identities, and the big-endian codecs
//! used on the wire.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of decimal places between one AGI token and one cog.
pub const AGI_DECIMALS: u32 = 8;
const COGS_PER_AGI: u128 = 100_000_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid amount `{input}`: {reason}")]
    InvalidAmount { input: String, reason: &'static str },
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("invalid group id `{0}`")]
    InvalidGroupId(String),
    #[error("channel id {0} does not fit in 4 bytes")]
    ChannelIdOverflow(u64),
    #[error("big-endian value of {len} bytes overflows {target}")]
    Overflow { len: usize, target: &'static str },
}

/// Amount in cogs, the smallest indivisible currency unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cogs(u128);

impl Cogs {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u128 {
        self.0
    }

    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// uint256 encoding: 32 bytes, big-endian, zero-padded.
    #[must_use]
    pub fn to_be_bytes32(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[16..].copy_from_slice(&self.0.to_be_bytes());
        out
    }

    /// Decodes an unsigned big-endian integer of up to 32 bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Result<Self, UnitError> {
        decode_be_u128(bytes, "cogs").map(Self)
    }

    /// Parses a decimal AGI amount (`"1.5"`) into cogs without floating point.
    pub fn from_agi_str(input: &str) -> Result<Self, UnitError> {
        let raw = input.trim();
        let invalid = |reason| UnitError::InvalidAmount {
            input: input.to_string(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("empty"));
        }

        let (whole, fraction) = match raw.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (raw, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("no digits"));
        }
        if !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid("not a decimal number"));
        }
        if fraction.len() > AGI_DECIMALS as usize {
            return Err(invalid("more than 8 fractional digits"));
        }

        let whole_cogs = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u128>()
                .map_err(|_| invalid("out of range"))?
                .checked_mul(COGS_PER_AGI)
                .ok_or_else(|| invalid("out of range"))?
        };
        let fraction_cogs = if fraction.is_empty() {
            0
        } else {
            let scale = 10u128.pow(AGI_DECIMALS - fraction.len() as u32);
            fraction
                .parse::<u128>()
                .map_err(|_| invalid("out of range"))?
                * scale
        };

        whole_cogs
            .checked_add(fraction_cogs)
            .map(Self)
            .ok_or_else(|| invalid("out of range"))
    }

    /// Renders the amount in AGI with trailing fractional zeros removed.
    #[must_use]
    pub fn to_agi_string(self) -> String {
        let whole = self.0 / COGS_PER_AGI;
        let fraction = self.0 % COGS_PER_AGI;
        if fraction == 0 {
            return whole.to_string();
        }
        let padded = format!("{fraction:08}");
        format!("{whole}.{}", padded.trim_end_matches('0'))
    }
}

impl fmt::Display for Cogs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Cogs {
    fn from(value: u64) -> Self {
        Self(u128::from(value))
    }
}

// Amounts travel as decimal strings in JSON; u128 does not survive every JSON
// consumer intact.
impl Serialize for Cogs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Cogs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Self::from(value)),
            Raw::Text(text) => text
                .trim()
                .parse::<u128>()
                .map(Self)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// 20-byte ledger account or contract address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 20]);

impl Address {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = UnitError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let decoded = hex::decode(digits).map_err(|_| UnitError::InvalidAddress(raw.to_string()))?;
        let bytes: [u8; 20] = decoded
            .try_into()
            .map_err(|_| UnitError::InvalidAddress(raw.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Payment group identifier, base64 encoded in service metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GroupId([u8; 32]);

impl GroupId {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for GroupId {
    type Err = UnitError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64
            .decode(raw.trim())
            .map_err(|_| UnitError::InvalidGroupId(raw.to_string()))?;
        let bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| UnitError::InvalidGroupId(raw.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl Serialize for GroupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Channel id as the 4-byte big-endian field of the state query.
pub fn encode_channel_id(channel_id: u64) -> Result<[u8; 4], UnitError> {
    u32::try_from(channel_id)
        .map(u32::to_be_bytes)
        .map_err(|_| UnitError::ChannelIdOverflow(channel_id))
}

/// uint256 encoding of a `u64` (channel ids, nonces).
#[must_use]
pub fn u64_to_be_bytes32(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

pub fn decode_be_u64(bytes: &[u8]) -> Result<u64, UnitError> {
    let wide = decode_be_u128(bytes, "u64")?;
    u64::try_from(wide).map_err(|_| UnitError::Overflow {
        len: bytes.len(),
        target: "u64",
    })
}

fn decode_be_u128(bytes: &[u8], target: &'static str) -> Result<u128, UnitError> {
    let significant = match bytes.iter().position(|b| *b != 0) {
        Some(start) => &bytes[start..],
        None => return Ok(0),
    };
    if significant.len() > 16 {
        return Err(UnitError::Overflow {
            len: bytes.len(),
            target,
        });
    }
    let mut buf = [0u8; 16];
    buf[16 - significant.len()..].copy_from_slice(significant);
    Ok(u128::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::{
        Address, Cogs, GroupId, UnitError, decode_be_u64, encode_channel_id, u64_to_be_bytes32,
    };

    #[test]
    fn agi_strings_convert_to_cogs_exactly() -> Result<(), UnitError> {
        assert_eq!(Cogs::from_agi_str("1")?, Cogs::new(100_000_000));
        assert_eq!(Cogs::from_agi_str("1.5")?, Cogs::new(150_000_000));
        assert_eq!(Cogs::from_agi_str("0.00000001")?, Cogs::new(1));
        assert_eq!(Cogs::from_agi_str(".25")?, Cogs::new(25_000_000));
        assert_eq!(Cogs::new(150_000_000).to_agi_string(), "1.5");
        assert_eq!(Cogs::new(1).to_agi_string(), "0.00000001");
        assert_eq!(Cogs::new(300_000_000).to_agi_string(), "3");
        Ok(())
    }

    #[test]
    fn agi_parser_rejects_precision_loss_and_junk() {
        assert!(Cogs::from_agi_str("0.000000001").is_err());
        assert!(Cogs::from_agi_str("1e5").is_err());
        assert!(Cogs::from_agi_str("-1").is_err());
        assert!(Cogs::from_agi_str(".").is_err());
        assert!(Cogs::from_agi_str("").is_err());
    }

    #[test]
    fn big_endian_amounts_decode_with_leading_zeros() -> Result<(), UnitError> {
        assert_eq!(Cogs::from_be_slice(&[])?, Cogs::ZERO);
        assert_eq!(Cogs::from_be_slice(&[0x01, 0xf4])?, Cogs::new(500));
        assert_eq!(Cogs::from_be_slice(&Cogs::new(500).to_be_bytes32())?, Cogs::new(500));
        assert_eq!(decode_be_u64(&u64_to_be_bytes32(7))?, 7);
        assert!(decode_be_u64(&[1, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        let mut too_wide = [0u8; 32];
        too_wide[15] = 1;
        assert!(Cogs::from_be_slice(&too_wide).is_err());
        Ok(())
    }

    #[test]
    fn channel_id_is_four_bytes_big_endian() -> Result<(), UnitError> {
        assert_eq!(encode_channel_id(7)?, [0, 0, 0, 7]);
        assert_eq!(encode_channel_id(0x0102_0304)?, [1, 2, 3, 4]);
        assert_eq!(
            encode_channel_id(u64::from(u32::MAX) + 1),
            Err(UnitError::ChannelIdOverflow(u64::from(u32::MAX) + 1))
        );
        Ok(())
    }

    #[test]
    fn addresses_and_group_ids_round_trip_through_text() -> Result<(), Box<dyn std::error::Error>> {
        let address: Address = "0x8FB1dC8df86b388C7e00689d1eCb533A160B4D0C".parse()?;
        assert_eq!(
            address.to_string(),
            "0x8fb1dc8df86b388c7e00689d1ecb533a160b4d0c"
        );
        assert!("0x1234".parse::<Address>().is_err());

        let group: GroupId = "m5FKWq4hW0foGW5qSbzGSjgZRuKs7A1ZwbIrJ9e96rc=".parse()?;
        assert_eq!(group.to_string(), "m5FKWq4hW0foGW5qSbzGSjgZRuKs7A1ZwbIrJ9e96rc=");
        assert!("c2hvcnQ=".parse::<GroupId>().is_err());

        let json = serde_json::to_string(&Cogs::new(42))?;
        assert_eq!(json, "\"42\"");
        let parsed: Cogs = serde_json::from_str("42")?;
        assert_eq!(parsed, Cogs::new(42));
        Ok(())
    }
}
