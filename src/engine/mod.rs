mod admission;
mod cancellation;
mod compaction;
mod error;
mod queries;
mod resources;
mod waitlist;

pub use admission::{Admission, decide};
pub use cancellation::CancelOutcome;
pub use error::EngineError;
pub use waitlist::{next_promotion, promotions};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotificationSink, notifications_for};
use crate::retry::RetryPolicy;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingFrame = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingFrame>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} frames: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingFrame]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller in this batch is told it failed, so none of its frames
        // may survive on disk or sit in front of the next batch.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further appends: {e}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            flush_and_respond(wal, &mut vec![(events, response)]);
        }
    }
}

/// Notifications produced by a committed unit of work, held until the row lock is released.
#[must_use]
pub struct Outbox(Vec<Notification>);

impl Outbox {
    pub fn notifications(&self) -> &[Notification] {
        &self.0
    }
}

/// One tenant's reservation engine.
///
/// All durable state lives in the WAL; the in-memory rows are rebuilt from it
/// on startup. Each resource's rows sit behind their own lock, and every
/// mutating operation holds the write guard from its first read to its commit.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<dyn NotificationSink>,
    /// Reverse lookup: reservation id → resource id
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so that no
    /// frame can be appended between its snapshot and the file swap.
    pub(super) compaction_gate: RwLock<()>,
    pub(super) retry: RetryPolicy,
}

/// Apply an event directly to a ResourceState (caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceUpdated {
            name,
            capacity,
            overflow,
            ..
        } => {
            rs.name = name.clone();
            rs.capacity = *capacity;
            rs.overflow = *overflow;
        }
        Event::ResourceClosed { .. } => rs.open = false,
        Event::ResourceReopened { .. } => rs.open = true,
        Event::ResourceDeleted { .. } => rs.retired = true,
        Event::ReservationConfirmed {
            id,
            resource_id,
            subject_id,
            notes,
            created_at,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                resource_id: *resource_id,
                subject_id: subject_id.clone(),
                state: ReservationState::Confirmed,
                queue_position: None,
                created_at: *created_at,
                notes: notes.clone(),
            });
            index.insert(*id, *resource_id);
        }
        Event::ReservationWaitlisted {
            id,
            resource_id,
            subject_id,
            notes,
            created_at,
            queue_position,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                resource_id: *resource_id,
                subject_id: subject_id.clone(),
                state: ReservationState::Waitlisted,
                queue_position: Some(*queue_position),
                created_at: *created_at,
                notes: notes.clone(),
            });
            index.insert(*id, *resource_id);
        }
        Event::ReservationPromoted { id, .. } => {
            rs.set_state(id, ReservationState::Confirmed);
        }
        Event::ReservationCancelled { id, .. } => {
            rs.set_state(id, ReservationState::Cancelled);
        }
        Event::ReservationCompleted { id, .. } => {
            rs.set_state(id, ReservationState::Completed);
        }
        // Handled at the map level, not here
        Event::ResourceCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<dyn NotificationSink>,
        retry: RetryPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let reservation_index = DashMap::new();

        // Replay into plain rows first; nothing else can see them yet.
        let mut rows: HashMap<Ulid, ResourceState> = HashMap::new();
        for event in &events {
            match event {
                Event::ResourceCreated {
                    id,
                    name,
                    capacity,
                    overflow,
                } => {
                    rows.insert(*id, ResourceState::new(*id, name.clone(), *capacity, *overflow));
                }
                Event::ResourceDeleted { id } => {
                    if let Some(rs) = rows.remove(id) {
                        for r in rs.reservations_by_creation() {
                            reservation_index.remove(&r.id);
                        }
                    }
                }
                other => {
                    if let Some(rs) = rows.get_mut(&other.resource_id()) {
                        apply_to_resource(rs, other, &reservation_index);
                    }
                }
            }
        }

        let state = DashMap::new();
        for (id, rs) in rows {
            state.insert(id, Arc::new(RwLock::new(rs)));
        }
        tracing::debug!(
            "replayed {} events into {} resources from {}",
            events.len(),
            state.len(),
            wal_path.display()
        );

        Ok(Self {
            state,
            wal_tx,
            notify,
            reservation_index,
            compaction_gate: RwLock::new(()),
            retry,
        })
    }

    /// Write one unit of work to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// Durably commit `events` as one unit, then apply them to the locked row.
    ///
    /// Nothing is applied if the WAL write fails. The returned outbox must be
    /// published after the guard is dropped.
    pub(super) async fn commit(
        &self,
        rs: &mut ResourceState,
        events: Vec<Event>,
    ) -> Result<Outbox, EngineError> {
        self.wal_append(events.clone()).await?;
        for event in &events {
            apply_to_resource(rs, event, &self.reservation_index);
        }
        let notifications = notifications_for(&events, now_ms(), |id| {
            rs.reservation(id).map(|r| r.subject_id.clone())
        });
        Ok(Outbox(notifications))
    }

    /// Hand post-commit notifications to the sink.
    pub(super) fn publish(&self, outbox: Outbox) {
        for n in &outbox.0 {
            self.notify.emit(n);
        }
    }

    /// Acquire the write lock on a resource row.
    ///
    /// Fails with `StoreTransactionConflict` if the row was deleted while we
    /// waited for it; a retry re-resolves the id.
    pub(super) async fn lock_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::StoreTransactionConflict(resource_id));
        }
        Ok(guard)
    }

    /// Lookup reservation → resource, then lock the resource row.
    pub(super) async fn lock_reservation(
        &self,
        reservation_id: Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_reservation(&reservation_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;
        let guard = match self.lock_resource(resource_id).await {
            Err(EngineError::ResourceNotFound(_)) => {
                return Err(EngineError::ReservationNotFound(reservation_id));
            }
            other => other?,
        };
        if guard.reservation(&reservation_id).is_none() {
            return Err(EngineError::ReservationNotFound(reservation_id));
        }
        Ok((resource_id, guard))
    }
}
