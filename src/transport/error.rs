use nats_jetstream_protocol::ApiError;
use thiserror::Error;

use crate::error::BoxError;

/// Failure reported by a [`Transport`](super::Transport) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("no responders on subject {0}")]
    NoResponders(String),
    #[error("jetstream api error: {0}")]
    Api(#[from] ApiError),
    #[error("malformed api response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected status {code}: {description}")]
    Status { code: u16, description: String },
    #[error("{0} was not acknowledged by the server")]
    NotAcknowledged(String),
    #[error("nats client error: {0}")]
    Nats(#[source] BoxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn nats(error: impl Into<BoxError>) -> Self {
        TransportError::Nats(error.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::Api(error) if error.is_not_found())
    }

    pub fn is_consumer_not_found(&self) -> bool {
        matches!(
            self,
            TransportError::Api(error) if error.is_not_found() && !error.is_stream_not_found()
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    /// The connection itself failed, rather than a single request.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Closed
                | TransportError::Nats(_)
                | TransportError::Io(_)
                | TransportError::NoResponders(_)
        )
    }
}
