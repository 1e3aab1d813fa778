use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::retry::retry_transient;

use super::waitlist::promotions;
use super::{Engine, EngineError};

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(EngineError::InvalidCapacity(capacity));
    }
    Ok(())
}

fn validate_name(name: Option<&str>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("resource name too long")),
        _ => Ok(()),
    }
}

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        overflow: OverflowPolicy,
    ) -> Result<(), EngineError> {
        validate_capacity(capacity)?;
        validate_name(name.as_deref())?;
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let _gate = self.compaction_gate.read().await;
        // The row is published already locked, so a concurrent writer that
        // finds it waits for the commit below.
        let mut guard = match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::ResourceAlreadyExists(id)),
            Entry::Vacant(slot) => {
                let row = Arc::new(RwLock::new(ResourceState::new(
                    id,
                    name.clone(),
                    capacity,
                    overflow,
                )));
                let guard = row
                    .clone()
                    .try_write_owned()
                    .map_err(|_| EngineError::StoreTransactionConflict(id))?;
                slot.insert(row);
                guard
            }
        };

        let event = Event::ResourceCreated {
            id,
            name,
            capacity,
            overflow,
        };
        match self.commit(&mut guard, vec![event]).await {
            Ok(outbox) => {
                drop(guard);
                self.publish(outbox);
                info!(resource = %id, capacity, overflow = overflow.as_str(), "resource created");
                Ok(())
            }
            Err(e) => {
                guard.retired = true;
                drop(guard);
                self.state.remove(&id);
                Err(e)
            }
        }
    }

    /// Rename, resize or change the overflow policy of a resource.
    ///
    /// Unset fields are filled from the row under its write guard, so
    /// concurrent partial updates never revert each other. Shrinking below
    /// the confirmed count is refused. Growing promotes waitlist heads into
    /// the new seats in the same commit.
    pub async fn update_resource(
        &self,
        id: Ulid,
        update: ResourceUpdate,
    ) -> Result<Vec<Reservation>, EngineError> {
        if let Some(capacity) = update.capacity {
            validate_capacity(capacity)?;
        }
        if let Some(name) = &update.name {
            validate_name(name.as_deref())?;
        }
        let promoted = retry_transient(&self.retry, || self.resize(id, update.clone())).await?;
        if !promoted.is_empty() {
            info!(resource = %id, promoted = promoted.len(), "resize promoted waitlist");
            metrics::counter!(crate::observability::PROMOTIONS_TOTAL)
                .increment(promoted.len() as u64);
        }
        Ok(promoted)
    }

    async fn resize(&self, id: Ulid, update: ResourceUpdate) -> Result<Vec<Reservation>, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_resource(id).await?;

        let name = update.name.unwrap_or_else(|| guard.name.clone());
        let capacity = update.capacity.unwrap_or(guard.capacity);
        let overflow = update.overflow.unwrap_or(guard.overflow);

        let confirmed = guard.confirmed_count();
        if (capacity as usize) < confirmed {
            return Err(EngineError::CapacityBelowConfirmed {
                capacity,
                confirmed,
            });
        }

        let mut events = vec![Event::ResourceUpdated {
            id,
            name,
            capacity,
            overflow,
        }];
        let promoted_events = promotions(&guard, capacity, confirmed);
        let promoted_ids: Vec<Ulid> = promoted_events
            .iter()
            .filter_map(|e| match e {
                Event::ReservationPromoted { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        events.extend(promoted_events);

        let outbox = self.commit(&mut guard, events).await?;
        let promoted = promoted_ids
            .iter()
            .filter_map(|rid| guard.reservation(rid).cloned())
            .collect();
        drop(guard);
        self.publish(outbox);
        Ok(promoted)
    }

    /// Stop accepting new reservations. Existing ones are unaffected.
    pub async fn close_resource(&self, id: Ulid) -> Result<(), EngineError> {
        retry_transient(&self.retry, || self.set_open(id, false)).await
    }

    pub async fn reopen_resource(&self, id: Ulid) -> Result<(), EngineError> {
        retry_transient(&self.retry, || self.set_open(id, true)).await
    }

    async fn set_open(&self, id: Ulid, open: bool) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_resource(id).await?;
        if guard.open == open {
            return Ok(());
        }
        let event = if open {
            Event::ResourceReopened { id }
        } else {
            Event::ResourceClosed { id }
        };
        let outbox = self.commit(&mut guard, vec![event]).await?;
        drop(guard);
        self.publish(outbox);
        info!(resource = %id, open, "resource open flag changed");
        Ok(())
    }

    /// Delete a resource with no active reservations, along with its history.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        retry_transient(&self.retry, || self.delete_row(id)).await
    }

    async fn delete_row(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_resource(id).await?;
        if guard.has_active() {
            return Err(EngineError::HasActiveReservations(id));
        }

        let outbox = self.commit(&mut guard, vec![Event::ResourceDeleted { id }]).await?;
        for r in guard.reservations_by_creation() {
            self.reservation_index.remove(&r.id);
        }
        self.state.remove(&id);
        drop(guard);
        self.publish(outbox);
        self.notify.resource_removed(&id);
        info!(resource = %id, "resource deleted");
        Ok(())
    }
}
