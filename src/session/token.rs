//! Compact signed bearer tokens for cross-context authorization.
//!
//! Tokens are three base64url segments (`header.payload.signature`) signed
//! with HMAC-SHA256. The signing key is derived with HKDF from process-local
//! entropy and a daily-rotating date salt, so tokens never outlive the
//! privileged process and rotate with the calendar day.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_ISSUER: &str = "walletcore";
const TOKEN_AUDIENCE: &str = "wallet-ui";
const KEY_INFO: &[u8] = b"session-token-signing";
const DATE_SALT_PREFIX: &str = "walletcore-token-key";

/// Claims carried inside a session token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenClaims {
    /// Subject: the account address this token authorizes.
    pub sub: String,
    /// Session this token is bound to.
    pub sid: Uuid,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

/// Mints and verifies session tokens.
///
/// One signer per privileged process; the ikm is generated at construction
/// and never leaves this struct.
pub struct TokenSigner {
    ikm: [u8; 32],
}

impl TokenSigner {
    /// Create a signer with fresh process-local entropy.
    pub fn new() -> Self {
        let mut ikm = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut ikm);
        Self { ikm }
    }

    /// Derive the signing key for the current calendar day.
    fn signing_key(&self) -> Result<[u8; 32], AuthError> {
        let date = Utc::now().format("%Y-%m-%d");
        let salt = Sha256::digest(format!("{DATE_SALT_PREFIX}-{date}").as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), &self.ikm);
        let mut okm = [0u8; 32];
        hk.expand(KEY_INFO, &mut okm)
            .map_err(|_| AuthError::InvalidToken {
                reason: "key derivation failed".to_string(),
            })?;
        Ok(okm)
    }

    /// Mint a token for `subject` bound to session `sid`.
    pub fn mint(&self, subject: &str, sid: Uuid, ttl_secs: u64) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            sub: subject.to_string(),
            sid,
            iat: now,
            exp: now + ttl_secs as i64,
            iss: TOKEN_ISSUER.to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
        };
        self.mint_claims(&claims)
    }

    fn mint_claims(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        let header = TokenHeader {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let header_json = serde_json::to_vec(&header).map_err(|e| AuthError::InvalidToken {
            reason: format!("header encoding failed: {e}"),
        })?;
        let payload_json = serde_json::to_vec(claims).map_err(|e| AuthError::InvalidToken {
            reason: format!("claims encoding failed: {e}"),
        })?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(payload_json)
        );
        let signature = self.sign(signing_input.as_bytes())?;

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, AuthError> {
        let key = self.signing_key()?;
        let mut mac =
            HmacSha256::new_from_slice(&key).map_err(|_| AuthError::InvalidToken {
                reason: "invalid signing key length".to_string(),
            })?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Verify signature and expiry, returning the claims.
    ///
    /// Session binding (`sid` against the live session) is the session
    /// manager's job; this only checks what the token itself asserts.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::InvalidToken {
                reason: "malformed token".to_string(),
            });
        };

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken {
                reason: "malformed signature".to_string(),
            })?;
        let signing_input = format!("{header}.{payload}");
        let expected = self.sign(signing_input.as_bytes())?;

        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(AuthError::InvalidToken {
                reason: "signature mismatch".to_string(),
            });
        }

        let payload_json =
            URL_SAFE_NO_PAD
                .decode(payload)
                .map_err(|_| AuthError::InvalidToken {
                    reason: "malformed payload".to_string(),
                })?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload_json).map_err(|e| AuthError::InvalidToken {
                reason: format!("claims decoding failed: {e}"),
            })?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::InvalidToken {
                reason: "token expired".to_string(),
            });
        }

        Ok(claims)
    }
}

impl Default for TokenSigner {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest used for blacklist entries; the raw token is never retained.
pub fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
