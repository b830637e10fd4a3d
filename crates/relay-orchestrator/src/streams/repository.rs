//! Stream persistence.
//!
//! Records live at `activeStream{id}` and are indexed in `streamList`.
//! Id allocation is a get-then-set on `lastUsedStreamId`: not atomic, which
//! is accepted because only `start` allocates and clients serialize their
//! own commands.

use super::model::Stream;
use crate::errors::OrchestratorError;
use crate::store::{keys, SharedStore};
use common::types::StreamId;
use std::sync::Arc;
use tracing::{debug, instrument};

/// What a `streamList` entry points at.
#[derive(Debug)]
pub enum StreamEntry {
    Live(Stream),
    Missing,
    Corrupt(String),
}

#[derive(Clone)]
pub struct StreamRepository {
    store: Arc<dyn SharedStore>,
}

impl StreamRepository {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Allocate the next stream id.
    pub async fn allocate_id(&self) -> Result<StreamId, OrchestratorError> {
        let last = match self.store.get(keys::LAST_USED_STREAM_ID).await? {
            Some(raw) => raw.parse::<StreamId>().map_err(|e| {
                OrchestratorError::Store(format!("corrupt {}: {e}", keys::LAST_USED_STREAM_ID))
            })?,
            None => StreamId(0),
        };

        let next = last.next();
        self.store
            .set(keys::LAST_USED_STREAM_ID, &next.to_string())
            .await?;
        Ok(next)
    }

    /// Load a stream.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent, `Store` when unreadable.
    pub async fn load(&self, id: StreamId) -> Result<Stream, OrchestratorError> {
        match self.read(id).await? {
            StreamEntry::Live(stream) => Ok(stream),
            StreamEntry::Missing => Err(OrchestratorError::NotFound(format!("stream {id}"))),
            StreamEntry::Corrupt(reason) => Err(OrchestratorError::Store(format!(
                "corrupt stream record {id}: {reason}"
            ))),
        }
    }

    /// Read a stream, keeping a missing or corrupt record apart from a
    /// store failure.
    ///
    /// # Errors
    ///
    /// `Store` only when the store itself fails.
    pub async fn read(&self, id: StreamId) -> Result<StreamEntry, OrchestratorError> {
        let Some(raw) = self.store.get(&keys::stream(id)).await? else {
            return Ok(StreamEntry::Missing);
        };
        Ok(match serde_json::from_str(&raw) {
            Ok(stream) => StreamEntry::Live(stream),
            Err(e) => StreamEntry::Corrupt(e.to_string()),
        })
    }

    /// Persist a stream and index it in `streamList`.
    pub async fn save(&self, stream: &Stream) -> Result<(), OrchestratorError> {
        let raw = serde_json::to_string(stream)
            .map_err(|e| OrchestratorError::Internal(format!("serialize stream: {e}")))?;
        let id = stream.id.to_string();

        self.store.set(&keys::stream(stream.id), &raw).await?;
        self.store.hset(keys::STREAM_LIST, &id, &id).await
    }

    /// Remove a stream record and its index entry.
    #[instrument(skip_all, fields(stream = %id))]
    pub async fn delete(&self, id: StreamId) -> Result<(), OrchestratorError> {
        self.store.hdel(keys::STREAM_LIST, &id.to_string()).await?;
        self.store.del(&keys::stream(id)).await?;
        debug!(target: "ro.streams", stream = %id, "Stream deleted");
        Ok(())
    }

    /// Raw `streamList` fields. Fields are not guaranteed to parse.
    pub async fn list_fields(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut fields: Vec<String> = self
            .store
            .hgetall(keys::STREAM_LIST)
            .await?
            .into_keys()
            .collect();
        fields.sort();
        Ok(fields)
    }

    /// Drop a `streamList` entry without touching any record.
    pub async fn drop_from_list(&self, field: &str) -> Result<(), OrchestratorError> {
        self.store.hdel(keys::STREAM_LIST, field).await
    }

    /// Reload, mutate and persist a stream.
    pub async fn update<F>(&self, id: StreamId, mutate: F) -> Result<Stream, OrchestratorError>
    where
        F: FnOnce(&mut Stream) + Send,
    {
        let mut stream = self.load(id).await?;
        mutate(&mut stream);
        self.save(&stream).await?;
        Ok(stream)
    }

    /// Clear the sticky instance pin. A missing stream is not an error.
    pub async fn clear_pin(&self, id: StreamId) -> Result<(), OrchestratorError> {
        match self.update(id, |stream| stream.media_instance = None).await {
            Ok(_) | Err(OrchestratorError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
