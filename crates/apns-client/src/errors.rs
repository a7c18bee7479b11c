//! Error taxonomy for the dispatch pipeline.

/// Faults scoped to a single request, as opposed to the transport or the
/// pipeline. The dispatcher treats the connection as still usable when
/// one of these occurs.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The payload could not be serialized.
    #[error("payload encoding: {0}")]
    Payload(#[source] serde_json::Error),
    /// The HTTP request could not be constructed, typically from an
    /// invalid header value.
    #[error("request construction: {0}")]
    Build(#[source] reqwest::Error),
    /// Signing the request failed.
    #[error("request signing: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    /// The response body could not be decoded.
    #[error("response decoding: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Everything that can go wrong pushing notifications.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// No client certificate and no signer: authentication with the
    /// gateway is not possible.
    #[error("authentication is not possible with no client certificate and no signer")]
    MissingAuth,
    /// The processing pipeline has not been started or has shut down.
    #[error("client processing pipeline not running")]
    ClientNotRunning,
    /// The processing pipeline was already started.
    #[error("client processing pipeline already started")]
    ClientAlreadyStarted,
    /// The processing pipeline was already closed.
    #[error("client processing pipeline already closed")]
    ClientAlreadyClosed,
    /// A blocked push was interrupted by client shutdown.
    #[error("push request interrupted")]
    PushInterrupted,
    /// The request's cancellation token fired before dispatch.
    #[error("push request canceled")]
    Canceled,
    /// The token lifespan exceeds the one hour the gateway honors.
    #[error("token lifespan must not exceed one hour")]
    TokenLifespan,
    /// The gateway URL is not usable.
    #[error("invalid gateway url: {0}")]
    Gateway(String),
    /// The streamer's connection was already closed.
    #[error("connection already closed")]
    ConnectionClosed,
    /// A fault scoped to this request only.
    #[error("request error: {0}")]
    Request(#[from] RequestError),
    /// An opaque error from the HTTP stack.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
}

impl PushError {
    /// Whether the error indicates a fault with the request rather than
    /// the connection it traveled on.
    pub fn is_request_scoped(&self) -> bool {
        matches!(self, PushError::Request(_))
    }
}
