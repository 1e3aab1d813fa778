//! Waitlist promotion.
//!
//! Promotion is never a unit of work on its own: these functions plan the
//! `ReservationPromoted` events that the caller commits together with the
//! change that freed the seat. Queue position is the only ordering key;
//! creation time plays no part.

use crate::model::{Event, Reservation, ResourceState};

/// The waitlist head, if a seat is free once `confirmed` seats are taken.
///
/// `confirmed` is the confirmed count as it will be after the caller's own
/// pending change, which is not yet applied to `rs`.
pub fn next_promotion(rs: &ResourceState, confirmed: usize) -> Option<&Reservation> {
    if confirmed >= rs.capacity as usize {
        return None;
    }
    rs.waitlist_head()
}

/// Promotion events for as many waitlist heads as `capacity` has room for,
/// in queue order.
pub fn promotions(rs: &ResourceState, capacity: u32, confirmed: usize) -> Vec<Event> {
    let free = (capacity as usize).saturating_sub(confirmed);
    rs.waitlist()
        .take(free)
        .map(|r| Event::ReservationPromoted {
            id: r.id,
            resource_id: rs.id,
        })
        .collect()
}
