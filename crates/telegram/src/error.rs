use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Telegram(#[from] teloxide::RequestError),

    /// teloxide ships its own reqwest; its builder errors are kept opaque.
    #[error("failed to build telegram http client: {0}")]
    Client(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid webhook url {url:?}: {source}")]
    WebhookUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
