use thiserror::Error;

/// Failure classes reported by the exchange, split the way the retry
/// policy needs them: fatal classes abort immediately, everything else
/// is retried with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// A response that passed transport but failed the success
    /// predicate (e.g. an order echo without a status field).
    #[error("unexpected exchange response: {0}")]
    BadResponse(String),

    #[error("exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// Fatal errors are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::Permission(_)
                | Self::InvalidArguments(_)
                | Self::InsufficientFunds(_)
                | Self::InvalidOrder(_)
                | Self::OrderNotFound(_)
        )
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// The raw library message (usually `bitmex {json}`), for the
    /// per-leg error parser.
    pub fn message(&self) -> &str {
        match self {
            Self::Authentication(message)
            | Self::Permission(message)
            | Self::InvalidArguments(message)
            | Self::InsufficientFunds(message)
            | Self::InvalidOrder(message)
            | Self::OrderNotFound(message)
            | Self::Network(message)
            | Self::Timeout(message)
            | Self::BadResponse(message)
            | Self::Other(message) => message,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid API Keys")]
    InvalidApiKeys { account_id: String },

    #[error("No matching account")]
    WrongAccount { account_id: String },

    #[error("No matching order")]
    WrongOrder { order_id: Option<String> },

    #[error("Invalid Message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;
