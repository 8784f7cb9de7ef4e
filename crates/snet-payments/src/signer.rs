//! Voucher and channel-state-query signatures.
//!
//! Messages are the packed encoding of a typed field tuple (`address` as 20
//! bytes, `uint256` as 32 big-endian bytes), hashed with keccak256 and signed
//! through the ledger's personal-message digest. Signatures are the raw
//! 65-byte `r || s || v` layout with `v = 27 + recovery_id`.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};

use crate::error::PaymentError;
use crate::units::{Address, Cogs, u64_to_be_bytes32};

const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Raw 65-byte recoverable signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature([u8; 65]);

impl RecoverableSignature {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PaymentError> {
        let raw: [u8; 65] = bytes.try_into().map_err(|_| {
            PaymentError::Signing(format!("signature must be 65 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(raw))
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecoverableSignature")
            .field(&self.to_hex())
            .finish()
    }
}

/// Ledger identity of the payer, optionally able to sign.
#[derive(Clone)]
pub struct Account {
    address: Address,
    signing_key: Option<SigningKey>,
}

impl Account {
    pub fn from_private_key_hex(private_key: &str) -> Result<Self, PaymentError> {
        let trimmed = private_key.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|error| PaymentError::Signing(format!("private key is not hex: {error}")))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|error| PaymentError::Signing(format!("invalid private key: {error}")))?;
        Ok(Self::from_signing_key(signing_key))
    }

    #[must_use]
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_of(signing_key.verifying_key());
        Self {
            address,
            signing_key: Some(signing_key),
        }
    }

    /// Account that can query balances but not sign.
    #[must_use]
    pub fn watch_only(address: Address) -> Self {
        Self {
            address,
            signing_key: None,
        }
    }

    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Signs `(contract, channel_id, nonce, amount)` authorizing the service
    /// to consider `amount` spent on the channel.
    pub fn sign_voucher(
        &self,
        contract: &Address,
        channel_id: u64,
        nonce: u64,
        amount: Cogs,
    ) -> Result<RecoverableSignature, PaymentError> {
        self.sign_message(&voucher_message(contract, channel_id, nonce, amount))
    }

    /// Signs the channel id alone; authenticates channel-state queries.
    pub fn sign_channel_id(&self, channel_id: u64) -> Result<RecoverableSignature, PaymentError> {
        self.sign_message(&u64_to_be_bytes32(channel_id))
    }

    fn sign_message(&self, message: &[u8]) -> Result<RecoverableSignature, PaymentError> {
        let signing_key = self.signing_key.as_ref().ok_or(PaymentError::NoSigningKey)?;
        let digest = personal_digest(message);
        let (signature, recovery_id) = signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|error| PaymentError::Signing(error.to_string()))?;

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = 27 + recovery_id.to_byte();
        Ok(RecoverableSignature(out))
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

pub fn recover_voucher_signer(
    contract: &Address,
    channel_id: u64,
    nonce: u64,
    amount: Cogs,
    signature: &RecoverableSignature,
) -> Result<Address, PaymentError> {
    recover_signer(&voucher_message(contract, channel_id, nonce, amount), signature)
}

#[must_use]
pub fn verify_voucher(
    expected_signer: &Address,
    contract: &Address,
    channel_id: u64,
    nonce: u64,
    amount: Cogs,
    signature: &RecoverableSignature,
) -> bool {
    recover_voucher_signer(contract, channel_id, nonce, amount, signature)
        .is_ok_and(|recovered| recovered == *expected_signer)
}

pub fn recover_channel_id_signer(
    channel_id: u64,
    signature: &RecoverableSignature,
) -> Result<Address, PaymentError> {
    recover_signer(&u64_to_be_bytes32(channel_id), signature)
}

fn recover_signer(message: &[u8], signature: &RecoverableSignature) -> Result<Address, PaymentError> {
    let raw = signature.as_bytes();
    let v = raw[64];
    let recovery_byte = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_byte(recovery_byte)
        .ok_or_else(|| PaymentError::Signing(format!("invalid recovery byte {v}")))?;
    let parsed = Signature::from_slice(&raw[..64])
        .map_err(|error| PaymentError::Signing(error.to_string()))?;
    let key = VerifyingKey::recover_from_prehash(&personal_digest(message), &parsed, recovery_id)
        .map_err(|error| PaymentError::Signing(error.to_string()))?;
    Ok(address_of(&key))
}

fn voucher_message(contract: &Address, channel_id: u64, nonce: u64, amount: Cogs) -> Vec<u8> {
    let mut message = Vec::with_capacity(20 + 32 * 3);
    message.extend_from_slice(contract.as_bytes());
    message.extend_from_slice(&u64_to_be_bytes32(channel_id));
    message.extend_from_slice(&u64_to_be_bytes32(nonce));
    message.extend_from_slice(&amount.to_be_bytes32());
    message
}

fn personal_digest(message: &[u8]) -> [u8; 32] {
    let hash = Keccak256::digest(message);
    let mut hasher = Keccak256::new();
    hasher.update(PERSONAL_MESSAGE_PREFIX);
    hasher.update(hash);
    hasher.finalize().into()
}

fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    Address::from_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::{
        Account, RecoverableSignature, recover_channel_id_signer, recover_voucher_signer,
        verify_voucher,
    };
    use crate::error::PaymentError;
    use crate::units::{Address, Cogs};

    const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn contract() -> Result<Address, Box<dyn std::error::Error>> {
        Ok("0x5e592f9b1d303183d963635f895f0f0c48284f4e".parse()?)
    }

    #[test]
    fn known_private_key_derives_expected_address() -> Result<(), PaymentError> {
        let account = Account::from_private_key_hex(TEST_KEY)?;
        assert_eq!(
            account.address().to_string(),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
        Ok(())
    }

    #[test]
    fn voucher_verifies_only_for_the_signed_tuple() -> Result<(), Box<dyn std::error::Error>> {
        let account = Account::from_private_key_hex(TEST_KEY)?;
        let contract = contract()?;
        let signature = account.sign_voucher(&contract, 7, 2, Cogs::new(500))?;
        let signer = account.address();

        assert!(verify_voucher(&signer, &contract, 7, 2, Cogs::new(500), &signature));
        assert!(!verify_voucher(&signer, &contract, 7, 2, Cogs::new(501), &signature));
        assert!(!verify_voucher(&signer, &contract, 7, 3, Cogs::new(500), &signature));
        assert!(!verify_voucher(&signer, &contract, 8, 2, Cogs::new(500), &signature));

        let other_contract: Address = "0x0000000000000000000000000000000000000001".parse()?;
        assert!(!verify_voucher(&signer, &other_contract, 7, 2, Cogs::new(500), &signature));
        Ok(())
    }

    #[test]
    fn repeated_signatures_over_same_input_both_verify() -> Result<(), Box<dyn std::error::Error>> {
        let account = Account::from_private_key_hex(TEST_KEY)?;
        let contract = contract()?;
        let first = account.sign_voucher(&contract, 1, 0, Cogs::new(10))?;
        let second = account.sign_voucher(&contract, 1, 0, Cogs::new(10))?;
        for signature in [first, second] {
            assert_eq!(
                recover_voucher_signer(&contract, 1, 0, Cogs::new(10), &signature)?,
                account.address()
            );
        }
        Ok(())
    }

    #[test]
    fn signature_layout_is_raw_65_bytes_with_ledger_v() -> Result<(), PaymentError> {
        let account = Account::from_private_key_hex(TEST_KEY)?;
        let signature = account.sign_channel_id(42)?;
        let v = signature.as_bytes()[64];
        assert!(v == 27 || v == 28);
        assert_eq!(recover_channel_id_signer(42, &signature)?, account.address());
        assert_ne!(recover_channel_id_signer(43, &signature)?, account.address());

        let reparsed = RecoverableSignature::from_slice(signature.as_bytes())?;
        assert_eq!(reparsed, signature);
        assert!(RecoverableSignature::from_slice(&[0u8; 64]).is_err());
        Ok(())
    }

    #[test]
    fn watch_only_account_cannot_sign() -> Result<(), Box<dyn std::error::Error>> {
        let account = Account::watch_only(contract()?);
        assert!(!account.can_sign());
        assert!(matches!(
            account.sign_channel_id(1),
            Err(PaymentError::NoSigningKey)
        ));
        assert!(matches!(
            account.sign_voucher(&contract()?, 1, 0, Cogs::new(1)),
            Err(PaymentError::NoSigningKey)
        ));
        Ok(())
    }
}
