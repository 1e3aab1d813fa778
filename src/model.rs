use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    Confirmed,
    Waitlisted,
    Cancelled,
    Completed,
}

impl ReservationState {
    /// Holds a seat or a place in the queue.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationState::Confirmed | ReservationState::Waitlisted)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationState::Confirmed => "confirmed",
            ReservationState::Waitlisted => "waitlisted",
            ReservationState::Cancelled => "cancelled",
            ReservationState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "confirmed" => Some(ReservationState::Confirmed),
            "waitlisted" => Some(ReservationState::Waitlisted),
            "cancelled" | "canceled" => Some(ReservationState::Cancelled),
            "completed" => Some(ReservationState::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What admission does once every seat is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    #[default]
    Waitlist,
    Reject,
}

impl OverflowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverflowPolicy::Waitlist => "waitlist",
            OverflowPolicy::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "waitlist" => Some(OverflowPolicy::Waitlist),
            "reject" => Some(OverflowPolicy::Reject),
            _ => None,
        }
    }
}

/// One subject's claim against one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub subject_id: String,
    pub state: ReservationState,
    /// Assigned only to reservations that entered the waitlist. Kept after promotion.
    pub queue_position: Option<u64>,
    pub created_at: Ms,
    pub notes: Option<String>,
}

/// A resource and every reservation made against it.
///
/// This is the unit the per-resource lock protects: all reads that feed an
/// admission decision and all writes that follow it go through one guard.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub overflow: OverflowPolicy,
    /// Closed resources accept no new reservations.
    pub open: bool,
    /// Set once the resource is deleted. A writer that acquired the lock on a
    /// retired row lost a race and must not commit against it.
    pub retired: bool,
    reservations: HashMap<Ulid, Reservation>,
    /// subject → its single active reservation.
    active_by_subject: HashMap<String, Ulid>,
    /// queue_position → waitlisted reservation. The first entry is the head.
    waitlist: BTreeMap<u64, Ulid>,
    next_queue_position: u64,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, capacity: u32, overflow: OverflowPolicy) -> Self {
        Self {
            id,
            name,
            capacity,
            overflow,
            open: true,
            retired: false,
            reservations: HashMap::new(),
            active_by_subject: HashMap::new(),
            waitlist: BTreeMap::new(),
            next_queue_position: 0,
        }
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// All reservations ordered by creation time, id as tie-break.
    pub fn reservations_by_creation(&self) -> Vec<&Reservation> {
        let mut all: Vec<&Reservation> = self.reservations.values().collect();
        all.sort_by_key(|r| (r.created_at, r.id));
        all
    }

    pub fn active_for_subject(&self, subject_id: &str) -> Option<&Reservation> {
        self.active_by_subject
            .get(subject_id)
            .and_then(|id| self.reservations.get(id))
    }

    /// The active reservation for `subject_id`, else its most recent terminal one.
    pub fn latest_for_subject(&self, subject_id: &str) -> Option<&Reservation> {
        if let Some(active) = self.active_for_subject(subject_id) {
            return Some(active);
        }
        self.reservations
            .values()
            .filter(|r| r.subject_id == subject_id)
            .max_by_key(|r| (r.created_at, r.id))
    }

    /// Counted from the rows on every call; there is no cached counter.
    pub fn confirmed_count(&self) -> usize {
        self.reservations
            .values()
            .filter(|r| r.state == ReservationState::Confirmed)
            .count()
    }

    pub fn has_free_seat(&self) -> bool {
        self.confirmed_count() < self.capacity as usize
    }

    pub fn has_active(&self) -> bool {
        !self.active_by_subject.is_empty()
    }

    pub fn waitlist_len(&self) -> usize {
        self.waitlist.len()
    }

    /// Waitlisted reservations in promotion order.
    pub fn waitlist(&self) -> impl Iterator<Item = &Reservation> {
        self.waitlist
            .values()
            .filter_map(|id| self.reservations.get(id))
    }

    pub fn waitlist_head(&self) -> Option<&Reservation> {
        self.waitlist().next()
    }

    /// Position the next waitlisted reservation receives. Never reused.
    pub fn next_queue_position(&self) -> u64 {
        self.next_queue_position
    }

    /// Insert a freshly admitted reservation and index it.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        if reservation.state.is_active() {
            self.active_by_subject
                .insert(reservation.subject_id.clone(), reservation.id);
        }
        if let Some(pos) = reservation.queue_position {
            self.next_queue_position = self.next_queue_position.max(pos + 1);
            if reservation.state == ReservationState::Waitlisted {
                self.waitlist.insert(pos, reservation.id);
            }
        }
        self.reservations.insert(reservation.id, reservation);
    }

    /// Move a reservation to `state`, keeping the indexes in step.
    /// Returns the previous state, or `None` if the reservation is unknown.
    pub fn set_state(&mut self, id: &Ulid, state: ReservationState) -> Option<ReservationState> {
        let r = self.reservations.get_mut(id)?;
        let prev = r.state;
        r.state = state;
        if prev == ReservationState::Waitlisted
            && state != ReservationState::Waitlisted
            && let Some(pos) = r.queue_position
        {
            self.waitlist.remove(&pos);
        }
        // The subject may already hold a newer active reservation.
        if prev.is_active()
            && state.is_terminal()
            && self.active_by_subject.get(&r.subject_id) == Some(id)
        {
            self.active_by_subject.remove(&r.subject_id);
        }
        Some(prev)
    }
}

/// WAL event types. A committed unit of work is a list of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        overflow: OverflowPolicy,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        overflow: OverflowPolicy,
    },
    ResourceClosed {
        id: Ulid,
    },
    ResourceReopened {
        id: Ulid,
    },
    ResourceDeleted {
        id: Ulid,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
        subject_id: String,
        notes: Option<String>,
        created_at: Ms,
    },
    ReservationWaitlisted {
        id: Ulid,
        resource_id: Ulid,
        subject_id: String,
        notes: Option<String>,
        created_at: Ms,
        queue_position: u64,
    },
    ReservationPromoted {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationCompleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    /// The resource this event mutates.
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { id, .. }
            | Event::ResourceUpdated { id, .. }
            | Event::ResourceClosed { id }
            | Event::ResourceReopened { id }
            | Event::ResourceDeleted { id } => *id,
            Event::ReservationConfirmed { resource_id, .. }
            | Event::ReservationWaitlisted { resource_id, .. }
            | Event::ReservationPromoted { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. }
            | Event::ReservationCompleted { resource_id, .. } => *resource_id,
        }
    }
}

/// Partial change to a resource. `None` fields keep their current value;
/// `name: Some(None)` clears the name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceUpdate {
    pub name: Option<Option<String>>,
    pub capacity: Option<u32>,
    pub overflow: Option<OverflowPolicy>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity: u32,
    pub overflow: OverflowPolicy,
    pub open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub resource_id: Ulid,
    pub capacity: u32,
    pub confirmed_count: usize,
    pub waitlist_length: usize,
    pub open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(rid: Ulid, subject: &str, state: ReservationState, pos: Option<u64>) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: rid,
            subject_id: subject.into(),
            state,
            queue_position: pos,
            created_at: 1000,
            notes: None,
        }
    }

    #[test]
    fn state_helpers() {
        assert!(ReservationState::Confirmed.is_active());
        assert!(ReservationState::Waitlisted.is_active());
        assert!(ReservationState::Cancelled.is_terminal());
        assert!(ReservationState::Completed.is_terminal());
        assert_eq!(ReservationState::parse("Completed"), Some(ReservationState::Completed));
        assert_eq!(ReservationState::parse("canceled"), Some(ReservationState::Cancelled));
        assert_eq!(ReservationState::parse("pending"), None);
    }

    #[test]
    fn overflow_parse() {
        assert_eq!(OverflowPolicy::parse("REJECT"), Some(OverflowPolicy::Reject));
        assert_eq!(OverflowPolicy::parse("waitlist"), Some(OverflowPolicy::Waitlist));
        assert_eq!(OverflowPolicy::default(), OverflowPolicy::Waitlist);
        assert!(OverflowPolicy::parse("drop").is_none());
    }

    #[test]
    fn confirmed_count_is_derived_from_rows() {
        let mut rs = ResourceState::new(Ulid::new(), None, 2, OverflowPolicy::Waitlist);
        assert!(rs.has_free_seat());
        let a = reservation(rs.id, "a", ReservationState::Confirmed, None);
        let a_id = a.id;
        rs.insert_reservation(a);
        rs.insert_reservation(reservation(rs.id, "b", ReservationState::Confirmed, None));
        assert_eq!(rs.confirmed_count(), 2);
        assert!(!rs.has_free_seat());

        rs.set_state(&a_id, ReservationState::Cancelled);
        assert_eq!(rs.confirmed_count(), 1);
        assert!(rs.has_free_seat());
    }

    #[test]
    fn waitlist_orders_by_queue_position() {
        let mut rs = ResourceState::new(Ulid::new(), None, 1, OverflowPolicy::Waitlist);
        // Inserted out of order on purpose
        let c = reservation(rs.id, "c", ReservationState::Waitlisted, Some(2));
        let a = reservation(rs.id, "a", ReservationState::Waitlisted, Some(0));
        let b = reservation(rs.id, "b", ReservationState::Waitlisted, Some(1));
        rs.insert_reservation(c);
        rs.insert_reservation(a);
        rs.insert_reservation(b);

        let order: Vec<&str> = rs.waitlist().map(|r| r.subject_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(rs.waitlist_head().unwrap().subject_id, "a");
        assert_eq!(rs.next_queue_position(), 3);
    }

    #[test]
    fn promotion_leaves_waitlist_but_keeps_position() {
        let mut rs = ResourceState::new(Ulid::new(), None, 1, OverflowPolicy::Waitlist);
        let w = reservation(rs.id, "w", ReservationState::Waitlisted, Some(0));
        let wid = w.id;
        rs.insert_reservation(w);

        let prev = rs.set_state(&wid, ReservationState::Confirmed);
        assert_eq!(prev, Some(ReservationState::Waitlisted));
        assert_eq!(rs.waitlist_len(), 0);
        assert_eq!(rs.reservation(&wid).unwrap().queue_position, Some(0));
        // Still active for its subject
        assert_eq!(rs.active_for_subject("w").unwrap().id, wid);
        // Position 0 is never handed out again
        assert_eq!(rs.next_queue_position(), 1);
    }

    #[test]
    fn terminal_state_frees_subject_slot() {
        let mut rs = ResourceState::new(Ulid::new(), None, 1, OverflowPolicy::Waitlist);
        let r = reservation(rs.id, "x", ReservationState::Confirmed, None);
        let rid = r.id;
        rs.insert_reservation(r);
        assert!(rs.has_active());

        rs.set_state(&rid, ReservationState::Completed);
        assert!(rs.active_for_subject("x").is_none());
        assert!(!rs.has_active());
        // History still answers for the subject
        assert_eq!(rs.latest_for_subject("x").unwrap().id, rid);
    }

    #[test]
    fn latest_for_subject_prefers_active() {
        let mut rs = ResourceState::new(Ulid::new(), None, 1, OverflowPolicy::Waitlist);
        let mut old = reservation(rs.id, "x", ReservationState::Cancelled, None);
        old.created_at = 5000;
        rs.insert_reservation(old);
        let mut current = reservation(rs.id, "x", ReservationState::Waitlisted, Some(0));
        current.created_at = 100;
        let current_id = current.id;
        rs.insert_reservation(current);

        assert_eq!(rs.latest_for_subject("x").unwrap().id, current_id);
    }

    #[test]
    fn ending_old_reservation_keeps_newer_active_one() {
        let mut rs = ResourceState::new(Ulid::new(), None, 2, OverflowPolicy::Waitlist);
        let old = reservation(rs.id, "x", ReservationState::Confirmed, None);
        let old_id = old.id;
        let new = reservation(rs.id, "x", ReservationState::Confirmed, None);
        let new_id = new.id;
        rs.insert_reservation(old);
        rs.insert_reservation(new);

        rs.set_state(&old_id, ReservationState::Cancelled);
        assert_eq!(rs.active_for_subject("x").unwrap().id, new_id);
        assert!(rs.has_active());
    }

    #[test]
    fn set_state_unknown_returns_none() {
        let mut rs = ResourceState::new(Ulid::new(), None, 1, OverflowPolicy::Waitlist);
        assert!(rs.set_state(&Ulid::new(), ReservationState::Cancelled).is_none());
    }

    #[test]
    fn event_resource_id() {
        let rid = Ulid::new();
        assert_eq!(Event::ResourceClosed { id: rid }.resource_id(), rid);
        assert_eq!(
            Event::ReservationPromoted { id: Ulid::new(), resource_id: rid }.resource_id(),
            rid
        );
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationWaitlisted {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            subject_id: "learner-7".into(),
            notes: Some("{\"seat\":\"aisle\"}".into()),
            created_at: 1_700_000_000_000,
            queue_position: 4,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
