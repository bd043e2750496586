use crate::errors::CredentialsError;
use crate::utils::epoch_millis;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signer, SigningKey};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use tracing::warn;
use uuid::Uuid;

const SIGN_VERSION: &str = "v1";

/// Exchange credentials, loaded once at startup and held only in memory.
///
/// The bearer token authenticates queries; mutating calls additionally carry
/// an Ed25519 signature over `"v1,<request-id>,<timestamp>,<payload>"`.
pub struct Credentials {
    token: Option<String>,
    signing_key: Option<SigningKey>,
    pub wallet_address: String,
    pub chain: String,
}

impl Credentials {
    /// A missing token or secret is allowed (the bot then runs view-only);
    /// a present but undecodable secret is a hard error.
    pub fn new(
        token: Option<String>,
        secret_raw: Option<&str>,
        wallet_address: String,
        chain: String,
    ) -> Result<Self, CredentialsError> {
        let signing_key = match secret_raw {
            Some(raw) => Some(decode_secret(raw)?),
            None => None,
        };
        Ok(Self {
            token,
            signing_key,
            wallet_address,
            chain,
        })
    }

    /// Read `STANDX_JWT_TOKEN`, `STANDX_ED25519_PRIVATE_KEY`,
    /// `STANDX_WALLET_ADDRESS` and `STANDX_CHAIN` from the environment.
    pub fn from_env() -> Result<Self, CredentialsError> {
        let token = std::env::var("STANDX_JWT_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let secret_raw = std::env::var("STANDX_ED25519_PRIVATE_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self::new(
            token,
            secret_raw.as_deref(),
            std::env::var("STANDX_WALLET_ADDRESS").unwrap_or_default(),
            std::env::var("STANDX_CHAIN").unwrap_or_else(|_| "bsc".to_string()),
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// `Authorization: Bearer <token>` when a token is configured.
    pub fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(v) => {
                    headers.insert(AUTHORIZATION, v);
                }
                Err(_) => warn!("bearer token contains non-header characters, omitting"),
            }
        }
        headers
    }

    /// Signature header set for one request body. Omitted entirely when no
    /// secret is configured; the exchange will reject the placement itself.
    pub fn sign_body(&self, payload: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some(key) = &self.signing_key else {
            return headers;
        };

        let request_id = Uuid::new_v4().simple().to_string();
        let timestamp = epoch_millis();
        let message = format!("{SIGN_VERSION},{request_id},{timestamp},{payload}");
        let signature = B64.encode(key.sign(message.as_bytes()).to_bytes());

        headers.insert("x-request-sign-version", HeaderValue::from_static(SIGN_VERSION));
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", v);
        }
        if let Ok(v) = HeaderValue::from_str(&timestamp.to_string()) {
            headers.insert("x-request-timestamp", v);
        }
        if let Ok(v) = HeaderValue::from_str(&signature) {
            headers.insert("x-request-signature", v);
        }
        headers
    }

    /// Bearer + signature + content-type, for mutating REST calls.
    pub fn full_headers(&self, payload: &str) -> HeaderMap {
        let mut headers = self.auth_headers();
        headers.extend(self.sign_body(payload));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }
}

/// The secret arrives as base58 (wallet export format) or plain hex. A
/// base58 reading only counts when it yields exactly 32 bytes; anything
/// else falls through to the hex path.
fn decode_secret(raw: &str) -> Result<SigningKey, CredentialsError> {
    if let Ok(bytes) = bs58::decode(raw).into_vec() {
        if let Ok(arr) = <[u8; 32]>::try_from(bytes) {
            return Ok(SigningKey::from_bytes(&arr));
        }
    }
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|_| CredentialsError::BadSecretEncoding)?;
    let len = bytes.len();
    let arr: [u8; 32] =
        <[u8; 32]>::try_from(bytes).map_err(|_| CredentialsError::BadSecretLength(len))?;
    Ok(SigningKey::from_bytes(&arr))
}
