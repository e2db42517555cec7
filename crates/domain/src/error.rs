/// Shared error type used across all `ra-*` crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("bus: {0}")]
    Bus(String),

    #[error("store: {0}")]
    Store(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("tool rpc: {0}")]
    ToolRpc(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
