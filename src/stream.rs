use std::sync::Arc;
use std::time::Duration;

use nats_jetstream_protocol::{AccountInfo, StreamDescriptor, StreamInfo};
use tracing::{debug, trace};

use crate::{
    error::{Error, ErrorCode},
    policy::{DiscardPolicy, FromSymbol, RetentionPolicy, StorageType},
    transport::{ensure_connected, JetStream},
    JetStreamResult,
};

const MAX_REPLICAS: usize = 5;

/// Caller side stream configuration, with policies as symbols.
///
/// Zero limits mean unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: String,
    pub max_bytes: i64,
    pub max_msgs: i64,
    #[cfg_attr(feature = "serde", serde(alias = "maxAge"))]
    pub max_age_seconds: i64,
    pub replicas: usize,
    pub discard: String,
    pub storage: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            name: String::new(),
            subjects: Vec::new(),
            retention: String::new(),
            max_bytes: 0,
            max_msgs: 0,
            max_age_seconds: 0,
            replicas: 1,
            discard: String::new(),
            storage: String::new(),
        }
    }
}

impl StreamConfig {
    pub fn new(
        name: impl Into<String>,
        subjects: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        StreamConfig {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> JetStreamResult<()> {
        if self.name.is_empty() {
            return Err(ErrorCode::EmptyStreamName.into());
        }
        if self.subjects.is_empty() {
            return Err(Error::new(
                ErrorCode::InvalidConfig,
                "at least one subject is required",
            ));
        }
        if self.max_bytes < 0 {
            return Err(Error::new(ErrorCode::InvalidConfig, "maxBytes must be non-negative"));
        }
        if self.max_msgs < 0 {
            return Err(Error::new(ErrorCode::InvalidConfig, "maxMsgs must be non-negative"));
        }
        if self.max_age_seconds < 0 {
            return Err(Error::new(ErrorCode::InvalidConfig, "maxAge must be non-negative"));
        }
        validate_replicas(self.replicas)
    }

    /// Resolves the symbolic policies into the descriptor sent to the server.
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            name: self.name.clone(),
            subjects: self.subjects.clone(),
            retention: RetentionPolicy::from_symbol(&self.retention),
            max_messages: self.max_msgs,
            max_bytes: self.max_bytes,
            max_age: Duration::from_secs(self.max_age_seconds.max(0) as u64),
            storage: StorageType::from_symbol(&self.storage),
            discard: DiscardPolicy::from_symbol(&self.discard),
            num_replicas: self.replicas,
            ..Default::default()
        }
    }
}

fn validate_replicas(replicas: usize) -> JetStreamResult<()> {
    if (1..=MAX_REPLICAS).contains(&replicas) {
        Ok(())
    } else {
        Err(Error::new(
            ErrorCode::InvalidConfig,
            format!("replicas must be between 1 and {MAX_REPLICAS}"),
        ))
    }
}

/// Field level changes to an existing stream. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamPatch {
    pub name: String,
    pub max_bytes: Option<i64>,
    pub max_msgs: Option<i64>,
    pub max_age: Option<Duration>,
    pub replicas: Option<usize>,
    pub discard: Option<DiscardPolicy>,
}

impl StreamPatch {
    pub fn new(name: impl Into<String>) -> Self {
        StreamPatch {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn max_bytes(mut self, max_bytes: i64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn max_msgs(mut self, max_msgs: i64) -> Self {
        self.max_msgs = Some(max_msgs);
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = Some(replicas);
        self
    }

    pub fn discard(mut self, discard: DiscardPolicy) -> Self {
        self.discard = Some(discard);
        self
    }

    fn validate(&self) -> JetStreamResult<()> {
        if self.name.is_empty() {
            return Err(ErrorCode::EmptyStreamName.into());
        }
        if self.max_bytes.is_some_and(|max_bytes| max_bytes < 0) {
            return Err(Error::new(ErrorCode::InvalidConfig, "maxBytes must be non-negative"));
        }
        if self.max_msgs.is_some_and(|max_msgs| max_msgs < 0) {
            return Err(Error::new(ErrorCode::InvalidConfig, "maxMsgs must be non-negative"));
        }
        match self.replicas {
            Some(replicas) => validate_replicas(replicas),
            None => Ok(()),
        }
    }

    /// Returns `current` with every present field replaced. Fields the patch
    /// cannot express are copied over as they are.
    pub fn apply(&self, current: &StreamDescriptor) -> StreamDescriptor {
        let mut merged = current.clone();
        if let Some(max_bytes) = self.max_bytes {
            merged.max_bytes = max_bytes;
        }
        if let Some(max_msgs) = self.max_msgs {
            merged.max_messages = max_msgs;
        }
        if let Some(max_age) = self.max_age {
            merged.max_age = max_age;
        }
        if let Some(replicas) = self.replicas {
            merged.num_replicas = replicas;
        }
        if let Some(discard) = self.discard {
            merged.discard = discard;
        }
        merged
    }
}

/// Zero, empty and unknown values of the config mean "unchanged".
impl From<StreamConfig> for StreamPatch {
    fn from(config: StreamConfig) -> Self {
        if !config.subjects.is_empty() {
            debug!(stream = %config.name, "subjects are not updatable, ignoring them");
        }
        StreamPatch {
            max_bytes: (config.max_bytes > 0).then_some(config.max_bytes),
            max_msgs: (config.max_msgs > 0).then_some(config.max_msgs),
            max_age: (config.max_age_seconds > 0)
                .then(|| Duration::from_secs(config.max_age_seconds as u64)),
            replicas: (config.replicas > 0).then_some(config.replicas),
            discard: DiscardPolicy::try_from_symbol(&config.discard),
            name: config.name,
        }
    }
}

/// Creates, updates, deletes and queries streams.
#[derive(Clone)]
pub struct StreamManager {
    transport: Arc<dyn JetStream>,
}

impl StreamManager {
    pub(crate) fn new(transport: Arc<dyn JetStream>) -> Self {
        StreamManager { transport }
    }

    pub async fn create_stream(&self, config: &StreamConfig) -> JetStreamResult<StreamInfo> {
        config.validate()?;
        ensure_connected(&*self.transport)?;

        let descriptor = config.descriptor();
        debug!(stream = %descriptor.name, "creating stream");
        self.transport
            .create_stream(&descriptor)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::StreamCreateFailed, err))
    }

    /// Merges `patch` into the current configuration of the stream.
    pub async fn update_stream(
        &self,
        patch: impl Into<StreamPatch>,
    ) -> JetStreamResult<StreamInfo> {
        let patch = patch.into();
        patch.validate()?;
        ensure_connected(&*self.transport)?;

        let current = self
            .transport
            .stream_info(&patch.name)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::StreamLookupFailed, err))?;

        let merged = patch.apply(&current.config);
        trace!(stream = %patch.name, ?merged, "updating stream");
        self.transport
            .update_stream(&merged)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::StreamUpdateFailed, err))
    }

    pub async fn delete_stream(&self, name: &str) -> JetStreamResult<()> {
        validate_name(name)?;
        ensure_connected(&*self.transport)?;

        debug!(stream = name, "deleting stream");
        self.transport
            .delete_stream(name)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::StreamDeleteFailed, err))
    }

    pub async fn stream_info(&self, name: &str) -> JetStreamResult<StreamInfo> {
        validate_name(name)?;
        ensure_connected(&*self.transport)?;

        self.transport
            .stream_info(name)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::StreamInfoFailed, err))
    }

    pub async fn stream_names(&self) -> JetStreamResult<Vec<String>> {
        ensure_connected(&*self.transport)?;

        self.transport
            .stream_names(None)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ListFailed, err))
    }

    /// Name of the stream capturing `subject`.
    pub async fn find_stream_by_subject(&self, subject: &str) -> JetStreamResult<String> {
        if subject.is_empty() {
            return Err(ErrorCode::EmptySubject.into());
        }
        ensure_connected(&*self.transport)?;

        self.transport
            .stream_names(Some(subject))
            .await
            .map_err(|err| Error::from_transport(ErrorCode::ListFailed, err))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::StreamNotFound,
                    format!("no stream matches subject {subject}"),
                )
            })
    }

    /// Removes every message of the stream and returns how many there were.
    pub async fn purge_stream(&self, name: &str) -> JetStreamResult<u64> {
        validate_name(name)?;
        ensure_connected(&*self.transport)?;

        let purged = self
            .transport
            .purge_stream(name)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::PurgeFailed, err))?;
        debug!(stream = name, purged, "purged stream");
        Ok(purged)
    }

    pub async fn delete_message(&self, name: &str, sequence: u64) -> JetStreamResult<()> {
        validate_name(name)?;
        ensure_connected(&*self.transport)?;

        self.transport
            .delete_message(name, sequence)
            .await
            .map_err(|err| Error::from_transport(ErrorCode::MessageDeleteFailed, err))
    }

    pub async fn account_info(&self) -> JetStreamResult<AccountInfo> {
        ensure_connected(&*self.transport)?;

        self.transport
            .account_info()
            .await
            .map_err(|err| Error::from_transport(ErrorCode::AccountInfoFailed, err))
    }
}

fn validate_name(name: &str) -> JetStreamResult<()> {
    if name.is_empty() {
        Err(ErrorCode::EmptyStreamName.into())
    } else {
        Ok(())
    }
}
