use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::retry::retry_transient;

use super::{Engine, EngineError, now_ms};

/// Outcome of an admission decision for a new reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Confirm,
    Waitlist { queue_position: u64 },
}

/// Decide how a new request is admitted against a locked resource.
///
/// The caller must hold the write guard from this call until the resulting
/// reservation is committed, otherwise the count it is based on can go stale.
pub fn decide(rs: &ResourceState) -> Result<Admission, EngineError> {
    if rs.has_free_seat() {
        return Ok(Admission::Confirm);
    }
    match rs.overflow {
        OverflowPolicy::Waitlist => Ok(Admission::Waitlist {
            queue_position: rs.next_queue_position(),
        }),
        OverflowPolicy::Reject => Err(EngineError::ResourceAtCapacityNoWaitlist {
            resource_id: rs.id,
            capacity: rs.capacity,
        }),
    }
}

pub(super) fn validate_subject(subject_id: &str) -> Result<(), EngineError> {
    if subject_id.is_empty() {
        return Err(EngineError::LimitExceeded("subject id is empty"));
    }
    if subject_id.len() > MAX_SUBJECT_LEN {
        return Err(EngineError::LimitExceeded("subject id too long"));
    }
    Ok(())
}

impl Engine {
    /// Confirm or waitlist `subject_id` on `resource_id`.
    ///
    /// Idempotent: if the subject already holds an active reservation on the
    /// resource, that reservation is returned unchanged and nothing is written.
    pub async fn request_reservation(
        &self,
        resource_id: Ulid,
        subject_id: &str,
        notes: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        validate_subject(subject_id)?;
        if let Some(n) = notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        retry_transient(&self.retry, || self.admit(resource_id, subject_id, notes)).await
    }

    async fn admit(
        &self,
        resource_id: Ulid,
        subject_id: &str,
        notes: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_resource(resource_id).await?;

        if let Some(existing) = guard.active_for_subject(subject_id) {
            debug!(reservation = %existing.id, %resource_id, "returning existing reservation");
            metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "existing")
                .increment(1);
            return Ok(existing.clone());
        }
        if !guard.open {
            return Err(EngineError::ResourceClosed(resource_id));
        }
        if guard.reservation_count() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }

        let admission = match decide(&guard) {
            Ok(a) => a,
            Err(e) => {
                metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "rejected")
                    .increment(1);
                return Err(e);
            }
        };

        let reservation = Reservation {
            id: Ulid::new(),
            resource_id,
            subject_id: subject_id.to_string(),
            state: match admission {
                Admission::Confirm => ReservationState::Confirmed,
                Admission::Waitlist { .. } => ReservationState::Waitlisted,
            },
            queue_position: match admission {
                Admission::Confirm => None,
                Admission::Waitlist { queue_position } => Some(queue_position),
            },
            created_at: now_ms(),
            notes: notes.map(str::to_string),
        };
        let event = match admission {
            Admission::Confirm => Event::ReservationConfirmed {
                id: reservation.id,
                resource_id,
                subject_id: reservation.subject_id.clone(),
                notes: reservation.notes.clone(),
                created_at: reservation.created_at,
            },
            Admission::Waitlist { queue_position } => Event::ReservationWaitlisted {
                id: reservation.id,
                resource_id,
                subject_id: reservation.subject_id.clone(),
                notes: reservation.notes.clone(),
                created_at: reservation.created_at,
                queue_position,
            },
        };

        let outbox = self.commit(&mut guard, vec![event]).await?;
        drop(guard);
        self.publish(outbox);

        debug!(
            reservation = %reservation.id,
            %resource_id,
            state = %reservation.state,
            queue_position = ?reservation.queue_position,
            "admitted"
        );
        metrics::counter!(
            crate::observability::RESERVATIONS_TOTAL,
            "outcome" => reservation.state.as_str()
        )
        .increment(1);
        Ok(reservation)
    }
}
