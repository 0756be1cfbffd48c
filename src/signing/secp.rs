//! secp256k1 signer with Ethereum-style digests.
//!
//! Messages are hashed with the EIP-191 personal-message prefix; typed data
//! uses the `\x19\x01` domain separation over canonical JSON. Signatures are
//! 65-byte `r || s || v` with `v` in {27, 28}.

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sha3::{Digest, Keccak256};

use crate::error::SigningError;

use super::{ExternalSigner, hex_decode, hex_encode};

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// EIP-191 personal-message digest.
pub fn eip191_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Domain-separated typed-data digest over canonical JSON.
pub fn typed_data_digest(typed_data: &Value) -> Result<[u8; 32], SigningError> {
    let domain = typed_data.get("domain").unwrap_or(&Value::Null);
    let message = typed_data.get("message").unwrap_or(&Value::Null);

    let encode = |value: &Value| {
        serde_json::to_vec(value).map_err(|e| SigningError::Internal {
            reason: format!("typed data encoding failed: {e}"),
        })
    };
    let domain_hash = keccak256(&encode(domain)?);
    let message_hash = keccak256(&encode(message)?);

    let mut buf = Vec::with_capacity(2 + 64);
    buf.extend_from_slice(b"\x19\x01");
    buf.extend_from_slice(&domain_hash);
    buf.extend_from_slice(&message_hash);
    Ok(keccak256(&buf))
}

/// Ethereum address for hex-encoded key material.
pub fn derive_address(material: &SecretString) -> Result<String, SigningError> {
    let key = key_from(material)?;
    let point = key.verifying_key().to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Ok(hex_encode(&hash[12..]))
}

fn key_from(material: &SecretString) -> Result<SigningKey, SigningError> {
    let bytes = hex_decode(material.expose_secret()).map_err(|_| SigningError::Internal {
        reason: "key material is not valid hex".to_string(),
    })?;
    SigningKey::from_slice(&bytes).map_err(|_| SigningError::Internal {
        reason: "key material is not a valid secp256k1 scalar".to_string(),
    })
}

/// Recoverable ECDSA signer over secp256k1.
#[derive(Default)]
pub struct Secp256k1Signer;

impl Secp256k1Signer {
    pub fn new() -> Self {
        Self
    }

    fn sign_digest(
        &self,
        material: &SecretString,
        digest: &[u8; 32],
    ) -> Result<String, SigningError> {
        let key = key_from(material)?;
        let (signature, recovery_id) =
            key.sign_prehash_recoverable(digest)
                .map_err(|e| SigningError::Internal {
                    reason: format!("signature generation failed: {e}"),
                })?;

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = 27 + recovery_id.to_byte();
        Ok(hex_encode(&out))
    }
}

#[async_trait]
impl ExternalSigner for Secp256k1Signer {
    async fn sign_message(
        &self,
        material: &SecretString,
        message: &[u8],
    ) -> Result<String, SigningError> {
        self.sign_digest(material, &eip191_digest(message))
    }

    async fn sign_typed_data(
        &self,
        material: &SecretString,
        typed_data: &Value,
    ) -> Result<String, SigningError> {
        self.sign_digest(material, &typed_data_digest(typed_data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
    use serde_json::json;

    fn material() -> SecretString {
        SecretString::from(hex_encode(&[0x01u8; 32]))
    }

    #[test]
    fn derived_address_is_stable_and_well_formed() {
        let a = derive_address(&material()).unwrap();
        let b = derive_address(&material()).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("0x"));
        assert_eq!(a.len(), 42);
    }

    #[test]
    fn invalid_material_is_rejected() {
        assert!(derive_address(&SecretString::from("0xnothex")).is_err());
        // Zero is not a valid scalar.
        assert!(derive_address(&SecretString::from(hex_encode(&[0u8; 32]))).is_err());
    }

    #[test]
    fn digests_distinguish_messages() {
        assert_ne!(eip191_digest(b"hello"), eip191_digest(b"hello!"));
        // The prefix includes the length, so same bytes at different lengths
        // cannot collide with a plain keccak of the message.
        assert_ne!(eip191_digest(b"hello"), keccak256(b"hello"));
    }

    #[test]
    fn typed_data_digest_depends_on_domain_and_message() {
        let base = json!({"domain": {"name": "A"}, "message": {"v": 1}});
        let other_domain = json!({"domain": {"name": "B"}, "message": {"v": 1}});
        let other_message = json!({"domain": {"name": "A"}, "message": {"v": 2}});

        let d0 = typed_data_digest(&base).unwrap();
        assert_ne!(d0, typed_data_digest(&other_domain).unwrap());
        assert_ne!(d0, typed_data_digest(&other_message).unwrap());
        assert_eq!(d0, typed_data_digest(&base).unwrap());
    }

    #[tokio::test]
    async fn signature_recovers_to_signing_key() {
        let signer = Secp256k1Signer::new();
        let signature_hex = signer
            .sign_message(&material(), b"recoverable")
            .await
            .unwrap();

        let bytes = hex_decode(&signature_hex).unwrap();
        assert_eq!(bytes.len(), 65);
        let signature = Signature::from_slice(&bytes[..64]).unwrap();
        let recovery_id = RecoveryId::from_byte(bytes[64] - 27).unwrap();

        let digest = eip191_digest(b"recoverable");
        let recovered =
            VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id).unwrap();

        let expected = key_from(&material()).unwrap();
        assert_eq!(recovered, *expected.verifying_key());
    }
}
