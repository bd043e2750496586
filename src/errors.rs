use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    UnsupportedSymbol(String),

    #[error("invalid value for {0}: `{1}`")]
    BadEnvValue(String, String),

    #[error("{0} out of range: {1}")]
    OutOfRange(&'static str, f64),
}

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("ed25519 secret is neither valid base58 nor hex")]
    BadSecretEncoding,

    #[error("ed25519 secret must be 32 bytes, got {0}")]
    BadSecretLength(usize),
}

/// Failures surfaced by the exchange client. Only raising ticks count
/// against the engine's consecutive-failure budget; soft paths (qty
/// rejections, gone orders, query fallbacks) never construct one.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("exchange returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed exchange response: {0}")]
    Decode(#[from] serde_json::Error),
}
