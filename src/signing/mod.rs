//! Signing authorization.
//!
//! Every signing request carries the caller's session token. The authorizer
//! verifies the token and matches its subject against the address the
//! request wants to sign with before the credential store is touched;
//! decrypted material is scoped to the single signing call.

pub mod secp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AuthError, RpcError, SigningError};
use crate::session::SessionManager;

pub use secp::Secp256k1Signer;

/// Supported signing methods with their positional parameter rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMethod {
    /// `personal_sign(message, address)`.
    PersonalSign,
    /// `eth_signTypedData_v4(address, typed_data)`.
    SignTypedDataV4,
}

impl SigningMethod {
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "personal_sign" => Some(Self::PersonalSign),
            "eth_signTypedData_v4" => Some(Self::SignTypedDataV4),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersonalSign => "personal_sign",
            Self::SignTypedDataV4 => "eth_signTypedData_v4",
        }
    }

    /// Position of the signing address in the params array.
    fn address_position(&self) -> usize {
        match self {
            Self::PersonalSign => 1,
            Self::SignTypedDataV4 => 0,
        }
    }
}

/// Account entry held by the credential store.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub address: String,
    pub encrypted_material: Vec<u8>,
}

/// Encrypted account storage seam.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Whether the store is locked. A locked store cannot decrypt.
    async fn is_locked(&self) -> bool;

    /// Look up an account by address (case-insensitive).
    async fn find_account(&self, address: &str) -> Result<Option<AccountRecord>, SigningError>;

    /// Decrypt the signing material for one account.
    async fn decrypt_material(&self, account: &AccountRecord) -> Result<SecretString, SigningError>;
}

/// Signature production seam; implementations never see tokens or sessions.
#[async_trait]
pub trait ExternalSigner: Send + Sync {
    async fn sign_message(
        &self,
        material: &SecretString,
        message: &[u8],
    ) -> Result<String, SigningError>;

    async fn sign_typed_data(
        &self,
        material: &SecretString,
        typed_data: &Value,
    ) -> Result<String, SigningError>;
}

/// Response envelope returned for every signing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningResponse {
    pub id: Uuid,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Authorizes and executes signing requests.
pub struct SigningAuthorizer {
    session: Arc<SessionManager>,
    store: Arc<dyn CredentialStore>,
    signer: Arc<dyn ExternalSigner>,
}

impl SigningAuthorizer {
    pub fn new(
        session: Arc<SessionManager>,
        store: Arc<dyn CredentialStore>,
        signer: Arc<dyn ExternalSigner>,
    ) -> Self {
        Self {
            session,
            store,
            signer,
        }
    }

    /// Handle one signing request, returning a structured response.
    ///
    /// Failures never escape as errors; they are mapped to the numeric
    /// envelope so rejection, authorization failure, and internal faults
    /// stay distinguishable at the caller.
    pub async fn handle(
        &self,
        id: Uuid,
        method: &str,
        params: &[Value],
        token: &str,
    ) -> SigningResponse {
        match self.authorize_and_sign(method, params, token).await {
            Ok(signature) => SigningResponse {
                id,
                method: method.to_string(),
                result: Some(signature),
                error: None,
            },
            Err(e) => {
                tracing::warn!(%id, method, "Signing request failed: {e}");
                SigningResponse {
                    id,
                    method: method.to_string(),
                    result: None,
                    error: Some(RpcError::from(&e)),
                }
            }
        }
    }

    async fn authorize_and_sign(
        &self,
        method: &str,
        params: &[Value],
        token: &str,
    ) -> Result<String, SigningError> {
        let method = SigningMethod::parse(method).ok_or_else(|| SigningError::UnsupportedMethod {
            method: method.to_string(),
        })?;
        let address = param_str(params, method.address_position())?;

        // Token and subject checks run before the credential store is touched.
        let claims = self.session.verify_token(token).await?;
        if !claims.sub.eq_ignore_ascii_case(address) {
            return Err(SigningError::Auth(AuthError::InvalidToken {
                reason: "token subject does not match signing address".to_string(),
            }));
        }

        let account = self
            .store
            .find_account(address)
            .await?
            .ok_or_else(|| SigningError::AccountNotFound {
                address: address.to_string(),
            })?;

        // Decrypted material lives only for this call.
        let material = self.store.decrypt_material(&account).await?;
        match method {
            SigningMethod::PersonalSign => {
                let message = decode_message(param_str(params, 0)?)?;
                self.signer.sign_message(&material, &message).await
            }
            SigningMethod::SignTypedDataV4 => {
                let typed_data = parse_typed_data(params.get(1))?;
                self.signer.sign_typed_data(&material, &typed_data).await
            }
        }
    }
}

fn param_str(params: &[Value], position: usize) -> Result<&str, SigningError> {
    params
        .get(position)
        .and_then(Value::as_str)
        .ok_or_else(|| SigningError::InvalidParams {
            reason: format!("missing string parameter at position {position}"),
        })
}

/// Message parameter: 0x-hex decodes to bytes, anything else signs as UTF-8.
fn decode_message(raw: &str) -> Result<Vec<u8>, SigningError> {
    if raw.starts_with("0x")
        && let Ok(bytes) = hex_decode(raw)
    {
        return Ok(bytes);
    }
    Ok(raw.as_bytes().to_vec())
}

/// Typed data arrives as a JSON object or a JSON-encoded string.
fn parse_typed_data(param: Option<&Value>) -> Result<Value, SigningError> {
    match param {
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).map_err(|e| SigningError::InvalidParams {
                reason: format!("typed data is not valid JSON: {e}"),
            })
        }
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        _ => Err(SigningError::InvalidParams {
            reason: "missing typed data parameter".to_string(),
        }),
    }
}

/// Decode hex with optional 0x prefix.
pub fn hex_decode(input: &str) -> Result<Vec<u8>, SigningError> {
    let hex = input.strip_prefix("0x").unwrap_or(input);
    if hex.len() % 2 != 0 {
        return Err(SigningError::InvalidParams {
            reason: "odd-length hex string".to_string(),
        });
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| SigningError::InvalidParams {
                reason: "invalid hex string".to_string(),
            })
        })
        .collect()
}

/// Encode bytes as 0x-prefixed lowercase hex.
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// In-memory credential store for tests and embedded hosts.
///
/// Material is held as raw key bytes; `decrypt_material` hands them out as
/// hex only while the store is unlocked.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    locked: RwLock<bool>,
    accounts: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_locked(&self, locked: bool) {
        *self.locked.write().await = locked;
    }

    pub async fn insert_account(&self, address: &str, material: Vec<u8>) {
        self.accounts
            .write()
            .await
            .insert(address.to_ascii_lowercase(), material);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn is_locked(&self) -> bool {
        *self.locked.read().await
    }

    async fn find_account(&self, address: &str) -> Result<Option<AccountRecord>, SigningError> {
        let key = address.to_ascii_lowercase();
        Ok(self
            .accounts
            .read()
            .await
            .get(&key)
            .map(|material| AccountRecord {
                address: key.clone(),
                encrypted_material: material.clone(),
            }))
    }

    async fn decrypt_material(&self, account: &AccountRecord) -> Result<SecretString, SigningError> {
        if self.is_locked().await {
            return Err(SigningError::Internal {
                reason: "credential store is locked".to_string(),
            });
        }
        Ok(SecretString::from(hex_encode(&account.encrypted_material)))
    }
}
