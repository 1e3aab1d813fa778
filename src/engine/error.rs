use ulid::Ulid;

use crate::model::ReservationState;

#[derive(Debug)]
pub enum EngineError {
    ResourceNotFound(Ulid),
    ResourceAlreadyExists(Ulid),
    /// The resource accepts no new reservations.
    ResourceClosed(Ulid),
    ResourceAtCapacityNoWaitlist {
        resource_id: Ulid,
        capacity: u32,
    },
    ReservationNotFound(Ulid),
    AlreadyTerminal {
        id: Ulid,
        state: ReservationState,
    },
    InvalidTransition {
        id: Ulid,
        from: ReservationState,
        to: ReservationState,
    },
    InvalidCapacity(u32),
    CapacityBelowConfirmed {
        capacity: u32,
        confirmed: usize,
    },
    HasActiveReservations(Ulid),
    LimitExceeded(&'static str),
    /// Lost a race on the resource row. Safe to retry the whole operation.
    StoreTransactionConflict(Ulid),
    StoreUnavailable(String),
}

impl EngineError {
    /// Retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::StoreTransactionConflict(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::ResourceAlreadyExists(id) => write!(f, "resource already exists: {id}"),
            EngineError::ResourceClosed(id) => {
                write!(f, "resource {id} is closed to new reservations")
            }
            EngineError::ResourceAtCapacityNoWaitlist { resource_id, capacity } => {
                write!(f, "resource {resource_id} is full ({capacity} seats) and has no waitlist")
            }
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyTerminal { id, state } => {
                write!(f, "reservation {id} is already {state}")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id} cannot move from {from} to {to}")
            }
            EngineError::InvalidCapacity(cap) => write!(f, "invalid capacity: {cap}"),
            EngineError::CapacityBelowConfirmed { capacity, confirmed } => {
                write!(f, "capacity {capacity} is below the {confirmed} confirmed reservations")
            }
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot delete resource {id}: has active reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreTransactionConflict(id) => {
                write!(f, "transaction conflict on resource {id}")
            }
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
