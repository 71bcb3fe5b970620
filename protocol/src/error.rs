use async_nats::jetstream;
use derive_more::{Display, Error};
use num_enum::FromPrimitive;
use serde::{Deserialize, Serialize};

/// JetStream specific error codes, carried as `err_code` next to the HTTP-like `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
#[repr(u16)]
pub enum ApiErrorCode {
    ConsumerNameExists = 10013,
    ConsumerNotFound = 10014,
    NoMessageFound = 10037,
    JetStreamNotEnabled = 10039,
    StreamNameInUse = 10058,
    StreamNotFound = 10059,
    ConsumerAlreadyExists = 10148,
    ConsumerDoesNotExist = 10149,
    #[num_enum(catch_all)]
    Other(u16),
}

impl ApiErrorCode {
    pub fn value(&self) -> u16 {
        match self {
            ApiErrorCode::ConsumerNameExists => 10013,
            ApiErrorCode::ConsumerNotFound => 10014,
            ApiErrorCode::NoMessageFound => 10037,
            ApiErrorCode::JetStreamNotEnabled => 10039,
            ApiErrorCode::StreamNameInUse => 10058,
            ApiErrorCode::StreamNotFound => 10059,
            ApiErrorCode::ConsumerAlreadyExists => 10148,
            ApiErrorCode::ConsumerDoesNotExist => 10149,
            ApiErrorCode::Other(code) => *code,
        }
    }
}

impl Default for ApiErrorCode {
    fn default() -> Self {
        ApiErrorCode::Other(0)
    }
}

impl From<ApiErrorCode> for u16 {
    fn from(code: ApiErrorCode) -> Self {
        code.value()
    }
}

/// The `error` object of a failed API call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, Error)]
#[display("{description} (code {code}, err_code {})", err_code.value())]
pub struct ApiError {
    pub code: u16,
    #[serde(default)]
    pub err_code: ApiErrorCode,
    #[serde(default)]
    pub description: String,
}

impl ApiError {
    pub fn new(code: u16, err_code: ApiErrorCode, description: impl Into<String>) -> Self {
        ApiError {
            code,
            err_code,
            description: description.into(),
        }
    }

    pub fn stream_not_found() -> Self {
        ApiError::new(404, ApiErrorCode::StreamNotFound, "stream not found")
    }

    pub fn consumer_not_found() -> Self {
        ApiError::new(404, ApiErrorCode::ConsumerNotFound, "consumer not found")
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.err_code,
            ApiErrorCode::StreamNotFound
                | ApiErrorCode::ConsumerNotFound
                | ApiErrorCode::ConsumerDoesNotExist
        ) || self.code == 404
    }

    pub fn is_stream_not_found(&self) -> bool {
        self.err_code == ApiErrorCode::StreamNotFound
    }
}

impl From<&jetstream::Error> for ApiError {
    fn from(error: &jetstream::Error) -> Self {
        let value = serde_json::to_value(error).unwrap_or_default();
        let err_code = value["err_code"]
            .as_u64()
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or_default();

        ApiError::new(
            u16::try_from(error.code()).unwrap_or(500),
            ApiErrorCode::from(err_code),
            value["description"].as_str().unwrap_or_default(),
        )
    }
}
