use tokio::sync::oneshot;
use tracing::info;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

/// Minimal events that rebuild `rs` on replay, terminal history included.
fn snapshot(rs: &ResourceState) -> Vec<Event> {
    let mut events = vec![Event::ResourceCreated {
        id: rs.id,
        name: rs.name.clone(),
        capacity: rs.capacity,
        overflow: rs.overflow,
    }];
    if !rs.open {
        events.push(Event::ResourceClosed { id: rs.id });
    }
    // Terminal rows first, so replaying an old reservation's end can never
    // touch the subject's current one, whatever the timestamps say.
    let (terminal, active): (Vec<_>, Vec<_>) = rs
        .reservations_by_creation()
        .into_iter()
        .partition(|r| r.state.is_terminal());
    for r in terminal.into_iter().chain(active) {
        let (id, resource_id) = (r.id, r.resource_id);
        events.push(match r.queue_position {
            Some(queue_position) => Event::ReservationWaitlisted {
                id,
                resource_id,
                subject_id: r.subject_id.clone(),
                notes: r.notes.clone(),
                created_at: r.created_at,
                queue_position,
            },
            None => Event::ReservationConfirmed {
                id,
                resource_id,
                subject_id: r.subject_id.clone(),
                notes: r.notes.clone(),
                created_at: r.created_at,
            },
        });
        match (r.state, r.queue_position) {
            (ReservationState::Confirmed, Some(_)) => {
                events.push(Event::ReservationPromoted { id, resource_id })
            }
            (ReservationState::Cancelled, _) => {
                events.push(Event::ReservationCancelled { id, resource_id })
            }
            (ReservationState::Completed, _) => {
                events.push(Event::ReservationCompleted { id, resource_id })
            }
            _ => {}
        }
    }
    events
}

impl Engine {
    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the compaction gate exclusively, so no unit of work can commit
    /// between the snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let rows: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        let mut resources = 0usize;
        for rs in rows {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            resources += 1;
            events.extend(snapshot(&guard));
        }
        let event_count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        info!(resources, events = event_count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
