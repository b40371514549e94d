use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("retrieved invalid websocket URL: {0}")]
    BadEndpoint(#[from] url::ParseError),
    #[error("authentication failed with status {status}: {body}")]
    Auth { status: u16, body: String },
    #[error("invalid center in authentication response")]
    InvalidCenter,
}
