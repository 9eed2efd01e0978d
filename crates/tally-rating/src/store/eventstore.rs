//! EventStoreDB backends
//!
//! - State store: one stream per state key. Every put appends a full state
//!   snapshot; the stream revision of the latest event is the revision token.
//! - Log store: one stream per log key, appended with `NoStream` so a log id
//!   can only ever be written once.

use super::{LogStore, StateStore};
use async_trait::async_trait;
use eventstore::{
    AppendToStreamOptions, Client, ClientSettings, EventData, ExpectedRevision,
    ReadStreamOptions, RecordedEvent, StreamPosition,
};
use tally_common::{
    LogKey, RatedUsageLogEntry, RatedUsageState, Result, Revision, StateKey, TallyError,
};
use tracing::{debug, info, instrument};

const STATE_EVENT: &str = "RatedUsageStateWritten";
const LOG_EVENT: &str = "RatedUsageLogged";

/// Connect to EventStoreDB
pub fn connect(connection_string: &str) -> Result<Client> {
    let settings = connection_string.parse::<ClientSettings>().map_err(|e| {
        TallyError::Config(format!("Invalid EventStore connection string: {}", e))
    })?;

    let client = Client::new(settings)
        .map_err(|e| TallyError::Storage(format!("Failed to create EventStore client: {}", e)))?;

    info!("Connected to EventStoreDB");
    Ok(client)
}

async fn append(
    client: &Client,
    stream: &str,
    event: EventData,
    expected: ExpectedRevision,
    key: &str,
    expected_token: Option<u64>,
) -> Result<Revision> {
    let options = AppendToStreamOptions::default().expected_revision(expected);

    match client.append_to_stream(stream.to_string(), &options, event).await {
        Ok(result) => {
            debug!(stream, position = result.next_expected_version, "Event appended");
            Ok(Revision(result.next_expected_version))
        }
        Err(eventstore::Error::WrongExpectedVersion { .. }) => {
            Err(TallyError::ConcurrentRevisionConflict {
                key: key.to_string(),
                expected: expected_token,
            })
        }
        Err(e) => Err(TallyError::Storage(format!("Failed to append event: {}", e))),
    }
}

/// First event read from a stream with `options`, `None` when the stream
/// does not exist
async fn read_one(
    client: &Client,
    stream: &str,
    options: &ReadStreamOptions,
) -> Result<Option<RecordedEvent>> {
    let mut events = match client.read_stream(stream.to_string(), options).await {
        Ok(events) => events,
        Err(eventstore::Error::ResourceNotFound) => return Ok(None),
        Err(e) => return Err(TallyError::Storage(format!("Failed to read stream: {}", e))),
    };

    match events.next().await {
        Ok(Some(resolved)) => Ok(resolved.event),
        Ok(None) | Err(eventstore::Error::ResourceNotFound) => Ok(None),
        Err(e) => Err(TallyError::Storage(format!("Failed to read event: {}", e))),
    }
}

/// State store backed by one EventStoreDB stream per state key
#[derive(Clone)]
pub struct EventStoreStateStore {
    client: Client,
    stream_prefix: String,
}

impl EventStoreStateStore {
    pub fn new(client: Client, stream_prefix: impl Into<String>) -> Self {
        Self {
            client,
            stream_prefix: stream_prefix.into(),
        }
    }

    fn stream(&self, key: &StateKey) -> String {
        format!("{}-state/{}", self.stream_prefix, key)
    }
}

#[async_trait]
impl StateStore for EventStoreStateStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &StateKey) -> Result<Option<(RatedUsageState, Revision)>> {
        let options = ReadStreamOptions::default()
            .position(StreamPosition::End)
            .backwards()
            .max_count(1);

        let Some(event) = read_one(&self.client, &self.stream(key), &options).await? else {
            return Ok(None);
        };

        let mut state: RatedUsageState = event.as_json().map_err(|e| {
            TallyError::Serialization(format!("Failed to decode stored state: {}", e))
        })?;
        let revision = Revision(event.revision);
        state.revision = Some(revision);
        Ok(Some((state, revision)))
    }

    #[instrument(skip(self, state), fields(key = %key))]
    async fn put(
        &self,
        key: &StateKey,
        state: &RatedUsageState,
        expected: Option<Revision>,
    ) -> Result<Revision> {
        let event = EventData::json(STATE_EVENT, state)
            .map_err(|e| TallyError::Serialization(e.to_string()))?;
        let expected_revision = match expected {
            Some(revision) => ExpectedRevision::Exact(revision.0),
            None => ExpectedRevision::NoStream,
        };

        append(
            &self.client,
            &self.stream(key),
            event,
            expected_revision,
            &key.to_string(),
            expected.map(|r| r.0),
        )
        .await
    }
}

/// Log store backed by one write-once EventStoreDB stream per log key
#[derive(Clone)]
pub struct EventStoreLogStore {
    client: Client,
    stream_prefix: String,
}

impl EventStoreLogStore {
    pub fn new(client: Client, stream_prefix: impl Into<String>) -> Self {
        Self {
            client,
            stream_prefix: stream_prefix.into(),
        }
    }

    fn stream(&self, key: &LogKey) -> String {
        format!("{}-log/{}", self.stream_prefix, key)
    }
}

#[async_trait]
impl LogStore for EventStoreLogStore {
    #[instrument(skip(self, entry), fields(key = %key))]
    async fn put(&self, key: &LogKey, entry: &RatedUsageLogEntry) -> Result<Revision> {
        let event = EventData::json(LOG_EVENT, entry)
            .map_err(|e| TallyError::Serialization(e.to_string()))?;

        append(
            &self.client,
            &self.stream(key),
            event,
            ExpectedRevision::NoStream,
            &key.to_string(),
            None,
        )
        .await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &LogKey) -> Result<Option<RatedUsageLogEntry>> {
        let options = ReadStreamOptions::default()
            .position(StreamPosition::Start)
            .max_count(1);

        let Some(event) = read_one(&self.client, &self.stream(key), &options).await? else {
            return Ok(None);
        };

        let mut entry: RatedUsageLogEntry = event.as_json().map_err(|e| {
            TallyError::Serialization(format!("Failed to decode log entry: {}", e))
        })?;
        entry.store_id = Some(event.stream_id.clone());
        entry.store_revision = Some(Revision(event.revision));
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    //! Require a running EventStoreDB; run with `cargo test -- --ignored`.

    use super::*;
    use tally_common::{AggregatedUsageDoc, SequenceGenerator};

    fn client() -> Client {
        let url = std::env::var("TALLY_TEST_EVENTSTORE_URL")
            .unwrap_or_else(|_| "esdb://localhost:2113?tls=false".to_string());
        connect(&url).unwrap()
    }

    fn unique_org() -> String {
        format!("org-{}", SequenceGenerator::new().next_token())
    }

    #[tokio::test]
    #[ignore]
    async fn test_state_stream_round_trip() {
        let store = EventStoreStateStore::new(client(), "tally-test");
        let key = StateKey::new(unique_org(), 0);
        let state = RatedUsageState::seed(&AggregatedUsageDoc::new(key.organization_id(), 0, 1));

        assert!(store.get(&key).await.unwrap().is_none());
        let r0 = store.put(&key, &state, None).await.unwrap();
        let r1 = store.put(&key, &state, Some(r0)).await.unwrap();
        assert!(r1 > r0);

        let (_, revision) = store.get(&key).await.unwrap().unwrap();
        assert_eq!(revision, r1);

        let stale = store.put(&key, &state, Some(r0)).await;
        assert!(matches!(stale, Err(TallyError::ConcurrentRevisionConflict { .. })));
    }

    #[tokio::test]
    #[ignore]
    async fn test_log_stream_is_write_once() {
        let store = EventStoreLogStore::new(client(), "tally-test");
        let key = StateKey::new(unique_org(), 0).log_key("0000000000000001-00000");
        let state = RatedUsageState::seed(&AggregatedUsageDoc::new(key.organization_id(), 0, 1));
        let entry = RatedUsageLogEntry::snapshot(key.to_string(), &state, None);

        store.put(&key, &entry).await.unwrap();
        assert!(store.put(&key, &entry).await.is_err());
        assert!(store.get(&key).await.unwrap().unwrap().store_id.is_some());
    }
}
