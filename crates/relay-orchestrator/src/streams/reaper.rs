//! Stream reaper.
//!
//! One cycle walks `streamList`:
//!
//! | Condition | Action |
//! |-----------|--------|
//! | entry unparseable, record missing or corrupt | drop the list entry |
//! | store failure reading the record | skip until the next cycle |
//! | no presenter | delete the stream |
//! | presenter session gone | delete the stream |
//! | viewer session gone | free the viewer slot, tell the presenter |
//!
//! Every removal also evicts the room from the local placement cache.

use super::repository::{StreamEntry, StreamRepository};
use crate::errors::OrchestratorError;
use crate::notify::{ClientEvent, Notifier};
use crate::observability::metrics;
use crate::registry::InstanceRegistry;
use crate::users::UserRepository;
use common::types::{RoomKey, StreamId};
use tracing::{debug, info, warn};

/// What one cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub scanned: usize,
    pub deleted: usize,
    pub dropped_entries: usize,
    pub viewers_released: usize,
}

/// Run one reaper cycle.
///
/// # Errors
///
/// `Store` if `streamList` cannot be read. Per-stream failures are logged
/// and skipped.
pub async fn run_reaper_cycle(
    streams: &StreamRepository,
    users: &UserRepository,
    notifier: &Notifier,
    registry: &InstanceRegistry,
) -> Result<ReapSummary, OrchestratorError> {
    let mut summary = ReapSummary::default();

    for field in streams.list_fields().await? {
        summary.scanned += 1;
        let outcome = reap_one(streams, users, notifier, registry, &field, &mut summary).await;
        if let Err(e) = outcome {
            warn!(target: "ro.streams.reaper", entry = %field, error = %e, "Reaper skipped stream");
        }
    }

    if summary.deleted + summary.dropped_entries + summary.viewers_released > 0 {
        info!(
            target: "ro.streams.reaper",
            scanned = summary.scanned,
            deleted = summary.deleted,
            dropped_entries = summary.dropped_entries,
            viewers_released = summary.viewers_released,
            "Reaper cycle finished"
        );
    }
    Ok(summary)
}

async fn reap_one(
    streams: &StreamRepository,
    users: &UserRepository,
    notifier: &Notifier,
    registry: &InstanceRegistry,
    field: &str,
    summary: &mut ReapSummary,
) -> Result<(), OrchestratorError> {
    let id = field.parse::<StreamId>().ok();
    let entry = match id {
        Some(id) => streams.read(id).await?,
        None => StreamEntry::Missing,
    };

    let mut stream = match entry {
        StreamEntry::Live(stream) => stream,
        StreamEntry::Missing | StreamEntry::Corrupt(_) => {
            streams.drop_from_list(field).await?;
            if let Some(id) = id {
                registry.invalidate_room(&RoomKey::for_stream(id)).await;
            }
            metrics::record_stream_reaped("unreadable");
            summary.dropped_entries += 1;
            debug!(target: "ro.streams.reaper", entry = %field, "Dropped unreadable stream entry");
            return Ok(());
        }
    };

    let Some(presenter) = stream.presenter.clone() else {
        streams.delete(stream.id).await?;
        registry.invalidate_room(&stream.room_key()).await;
        metrics::record_stream_reaped("no_presenter");
        summary.deleted += 1;
        return Ok(());
    };

    if !users.exists(&presenter.id).await? {
        streams.delete(stream.id).await?;
        registry.invalidate_room(&stream.room_key()).await;
        metrics::record_stream_reaped("presenter_gone");
        summary.deleted += 1;
        info!(target: "ro.streams.reaper", stream = %stream.id, presenter = %presenter.id, "Presenter offline, stream removed");
        return Ok(());
    }

    if let Some(viewer) = stream.viewer.clone() {
        if !users.exists(&viewer.id).await? {
            stream.viewer = None;
            streams.save(&stream).await?;
            notifier.send(&presenter.socket, ClientEvent::StreamLeft { stream: stream.id });
            summary.viewers_released += 1;
            info!(target: "ro.streams.reaper", stream = %stream.id, viewer = %viewer.id, "Viewer offline, slot released");
        }
    }

    Ok(())
}
