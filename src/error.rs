use std::fmt;

use nats_jetstream_protocol::ApiErrorCode;
use thiserror::Error;

use crate::transport::TransportError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable numeric error codes.
///
/// Values are part of the public contract: a code never changes meaning and
/// retired codes are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    ConnectionClosed = 1002,
    InvalidConfig = 1003,
    StreamNotFound = 1004,
    ConsumerNotFound = 1005,
    Timeout = 1006,
    NoMessage = 1007,
    EmptySubject = 1008,
    PublishFailed = 1009,
    SubscribeFailed = 1010,
    RequestFailed = 1011,
    DrainFailed = 1012,
    FlushFailed = 1013,
    ConnectFailed = 1014,
    EmptyStreamName = 1015,
    StreamCreateFailed = 1016,
    StreamLookupFailed = 1017,
    StreamUpdateFailed = 1018,
    StreamDeleteFailed = 1019,
    StreamInfoFailed = 1020,
    StreamPublishFailed = 1021,
    StreamPublishAsyncFailed = 1022,
    EmptyConsumerName = 1024,
    ConsumerCreateFailed = 1025,
    ConsumerLookupFailed = 1026,
    ConsumerUpdateFailed = 1027,
    ConsumerDeleteFailed = 1028,
    ConsumerInfoFailed = 1029,
    PullSubscribeFailed = 1030,
    SubscriptionInactive = 1031,
    FetchFailed = 1032,
    PushSubscribeFailed = 1033,
    AccountInfoFailed = 1034,
    PurgeFailed = 1035,
    MessageDeleteFailed = 1036,
    ListFailed = 1037,
    AckFailed = 1038,
}

/// Coarse classification of an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller supplied an empty or invalid value; nothing was sent.
    Validation,
    /// The stream or consumer does not exist.
    NotFound,
    /// The server refused to create the resource.
    ConflictOrCreate,
    /// A pull deadline passed without messages. `fetch` reports this as an
    /// empty batch, never as an error.
    FetchTimeout,
    Fetch,
    ConnectionClosed,
    /// Any other failure reported by the transport.
    Transport,
}

const ALL_CODES: [ErrorCode; 36] = [
    ErrorCode::ConnectionClosed,
    ErrorCode::InvalidConfig,
    ErrorCode::StreamNotFound,
    ErrorCode::ConsumerNotFound,
    ErrorCode::Timeout,
    ErrorCode::NoMessage,
    ErrorCode::EmptySubject,
    ErrorCode::PublishFailed,
    ErrorCode::SubscribeFailed,
    ErrorCode::RequestFailed,
    ErrorCode::DrainFailed,
    ErrorCode::FlushFailed,
    ErrorCode::ConnectFailed,
    ErrorCode::EmptyStreamName,
    ErrorCode::StreamCreateFailed,
    ErrorCode::StreamLookupFailed,
    ErrorCode::StreamUpdateFailed,
    ErrorCode::StreamDeleteFailed,
    ErrorCode::StreamInfoFailed,
    ErrorCode::StreamPublishFailed,
    ErrorCode::StreamPublishAsyncFailed,
    ErrorCode::EmptyConsumerName,
    ErrorCode::ConsumerCreateFailed,
    ErrorCode::ConsumerLookupFailed,
    ErrorCode::ConsumerUpdateFailed,
    ErrorCode::ConsumerDeleteFailed,
    ErrorCode::ConsumerInfoFailed,
    ErrorCode::PullSubscribeFailed,
    ErrorCode::SubscriptionInactive,
    ErrorCode::FetchFailed,
    ErrorCode::PushSubscribeFailed,
    ErrorCode::AccountInfoFailed,
    ErrorCode::PurgeFailed,
    ErrorCode::MessageDeleteFailed,
    ErrorCode::ListFailed,
    ErrorCode::AckFailed,
];

impl ErrorCode {
    pub fn value(self) -> u16 {
        self as u16
    }

    pub fn from_value(value: u16) -> Option<ErrorCode> {
        ALL_CODES.iter().copied().find(|code| code.value() == value)
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::InvalidConfig
            | ErrorCode::EmptySubject
            | ErrorCode::EmptyStreamName
            | ErrorCode::EmptyConsumerName
            | ErrorCode::SubscriptionInactive => ErrorKind::Validation,
            ErrorCode::StreamNotFound | ErrorCode::ConsumerNotFound => ErrorKind::NotFound,
            ErrorCode::StreamCreateFailed | ErrorCode::ConsumerCreateFailed => {
                ErrorKind::ConflictOrCreate
            }
            ErrorCode::NoMessage => ErrorKind::FetchTimeout,
            ErrorCode::FetchFailed => ErrorKind::Fetch,
            ErrorCode::ConnectionClosed | ErrorCode::ConnectFailed => ErrorKind::ConnectionClosed,
            _ => ErrorKind::Transport,
        }
    }

    /// Default message used when none is given.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::ConnectionClosed => "connection is closed",
            ErrorCode::InvalidConfig => "invalid configuration",
            ErrorCode::StreamNotFound => "stream not found",
            ErrorCode::ConsumerNotFound => "consumer not found",
            ErrorCode::Timeout => "operation timed out",
            ErrorCode::NoMessage => "no message available",
            ErrorCode::EmptySubject => "subject cannot be empty",
            ErrorCode::PublishFailed => "publish failed",
            ErrorCode::SubscribeFailed => "subscription failed",
            ErrorCode::RequestFailed => "request failed",
            ErrorCode::DrainFailed => "drain failed",
            ErrorCode::FlushFailed => "flush failed",
            ErrorCode::ConnectFailed => "failed to connect",
            ErrorCode::EmptyStreamName => "stream name cannot be empty",
            ErrorCode::StreamCreateFailed => "failed to add stream",
            ErrorCode::StreamLookupFailed => "failed to load current stream config",
            ErrorCode::StreamUpdateFailed => "failed to update stream",
            ErrorCode::StreamDeleteFailed => "failed to delete stream",
            ErrorCode::StreamInfoFailed => "failed to get stream info",
            ErrorCode::StreamPublishFailed => "failed to publish to jetstream",
            ErrorCode::StreamPublishAsyncFailed => "failed to publish async to jetstream",
            ErrorCode::EmptyConsumerName => "consumer durable name cannot be empty",
            ErrorCode::ConsumerCreateFailed => "failed to add consumer",
            ErrorCode::ConsumerLookupFailed => "failed to load current consumer config",
            ErrorCode::ConsumerUpdateFailed => "failed to update consumer",
            ErrorCode::ConsumerDeleteFailed => "failed to delete consumer",
            ErrorCode::ConsumerInfoFailed => "failed to get consumer info",
            ErrorCode::PullSubscribeFailed => "failed to create pull subscription",
            ErrorCode::SubscriptionInactive => "subscription is no longer active",
            ErrorCode::FetchFailed => "failed to fetch messages",
            ErrorCode::PushSubscribeFailed => "failed to create push subscription",
            ErrorCode::AccountInfoFailed => "failed to get account info",
            ErrorCode::PurgeFailed => "failed to purge stream",
            ErrorCode::MessageDeleteFailed => "failed to delete message",
            ErrorCode::ListFailed => "failed to list names",
            ErrorCode::AckFailed => "failed to acknowledge message",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Error returned by every public operation of this crate.
#[derive(Debug, Error)]
#[error("jetstream error [{code}]: {message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Error {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Wraps a transport failure under `code`, unless the transport reports a
    /// closed connection or a missing stream/consumer, which keep their own
    /// codes whatever operation hit them.
    pub(crate) fn from_transport(code: ErrorCode, error: TransportError) -> Self {
        let code = match &error {
            TransportError::Closed => ErrorCode::ConnectionClosed,
            TransportError::Api(api) => match api.err_code {
                ApiErrorCode::StreamNotFound => ErrorCode::StreamNotFound,
                ApiErrorCode::ConsumerNotFound | ApiErrorCode::ConsumerDoesNotExist => {
                    ErrorCode::ConsumerNotFound
                }
                _ => code,
            },
            _ => code,
        };
        Error::with_source(code, code.description(), error)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// The transport failure this error wraps, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        self.source
            .as_ref()
            .and_then(|source| source.downcast_ref::<TransportError>())
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code, code.description())
    }
}
