use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::retry::retry_transient;

use super::waitlist::next_promotion;
use super::{Engine, EngineError};

/// What a cancellation (or completion) committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub resource_id: Ulid,
    /// The reservation as it was before leaving its active state.
    pub released: Reservation,
    /// The waitlist head confirmed in the same unit of work, if any.
    pub promoted: Option<Reservation>,
}

impl Engine {
    /// Cancel a confirmed or waitlisted reservation.
    ///
    /// The caller has already authorized `acting_subject_id`. A freed seat is
    /// handed to the head of the waitlist in the same commit. Not idempotent:
    /// cancelling a terminal reservation fails with `AlreadyTerminal`.
    pub async fn cancel_reservation(
        &self,
        reservation_id: Ulid,
        acting_subject_id: &str,
    ) -> Result<CancelOutcome, EngineError> {
        let outcome = retry_transient(&self.retry, || {
            self.release(reservation_id, ReservationState::Cancelled)
        })
        .await?;
        info!(
            reservation = %reservation_id,
            resource = %outcome.resource_id,
            acting_subject = acting_subject_id,
            promoted = ?outcome.promoted.as_ref().map(|r| r.id),
            "cancelled"
        );
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
        Ok(outcome)
    }

    /// Mark a confirmed reservation completed (the offering concluded).
    ///
    /// The seat it held is released like a cancellation, so the waitlist head
    /// is promoted in the same commit.
    pub async fn complete_reservation(
        &self,
        reservation_id: Ulid,
    ) -> Result<CancelOutcome, EngineError> {
        let outcome = retry_transient(&self.retry, || {
            self.release(reservation_id, ReservationState::Completed)
        })
        .await?;
        info!(reservation = %reservation_id, resource = %outcome.resource_id, "completed");
        Ok(outcome)
    }

    async fn release(
        &self,
        reservation_id: Ulid,
        to: ReservationState,
    ) -> Result<CancelOutcome, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let (resource_id, mut guard) = self.lock_reservation(reservation_id).await?;
        let released = guard
            .reservation(&reservation_id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;

        if released.state.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                id: reservation_id,
                state: released.state,
            });
        }
        if to == ReservationState::Completed && released.state != ReservationState::Confirmed {
            return Err(EngineError::InvalidTransition {
                id: reservation_id,
                from: released.state,
                to,
            });
        }

        let mut events = vec![match to {
            ReservationState::Completed => Event::ReservationCompleted {
                id: reservation_id,
                resource_id,
            },
            _ => Event::ReservationCancelled {
                id: reservation_id,
                resource_id,
            },
        }];

        let mut promoted = None;
        if released.state == ReservationState::Confirmed {
            let confirmed_after = guard.confirmed_count().saturating_sub(1);
            if let Some(head) = next_promotion(&guard, confirmed_after) {
                events.push(Event::ReservationPromoted {
                    id: head.id,
                    resource_id,
                });
                promoted = Some(head.id);
            }
        }

        let outbox = self.commit(&mut guard, events).await?;
        let promoted = promoted.and_then(|id| guard.reservation(&id).cloned());
        drop(guard);
        self.publish(outbox);

        if promoted.is_some() {
            metrics::counter!(crate::observability::PROMOTIONS_TOTAL).increment(1);
        }
        Ok(CancelOutcome {
            resource_id,
            released,
            promoted,
        })
    }
}
