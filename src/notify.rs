use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, Ms};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Confirmed,
    Waitlisted,
    Promoted,
    Cancelled,
    Completed,
}

impl NotificationKind {
    pub fn event_type(self) -> &'static str {
        match self {
            NotificationKind::Confirmed => "reservation.confirmed",
            NotificationKind::Waitlisted => "reservation.waitlisted",
            NotificationKind::Promoted => "reservation.promoted",
            NotificationKind::Cancelled => "reservation.cancelled",
            NotificationKind::Completed => "reservation.completed",
        }
    }
}

/// A reservation state change, handed to the sink after its unit of work committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub reservation_id: Ulid,
    pub resource_id: Ulid,
    pub subject_id: String,
    pub timestamp: Ms,
}

/// Fire-and-forget consumer of reservation notifications.
///
/// Implementations must not block: `emit` runs on the request path, after
/// commit. Delivery failures are the sink's own concern.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: &Notification);

    /// Called once a resource is deleted; nothing more will be emitted for it.
    fn resource_removed(&self, _resource_id: &Ulid) {}
}

/// Broadcast hub fanning notifications out to per-resource subscribers.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Remove a channel (e.g. when resource is deleted).
    pub fn remove(&self, resource_id: &Ulid) {
        self.channels.remove(resource_id);
    }
}

impl NotificationSink for NotifyHub {
    /// No-op if nobody is listening.
    fn emit(&self, notification: &Notification) {
        tracing::debug!(
            event_type = notification.kind.event_type(),
            reservation_id = %notification.reservation_id,
            resource_id = %notification.resource_id,
            "notify"
        );
        if let Some(sender) = self.channels.get(&notification.resource_id) {
            let _ = sender.send(notification.clone());
        }
    }

    fn resource_removed(&self, resource_id: &Ulid) {
        self.remove(resource_id);
    }
}

/// Map committed events to the notifications they produce. Resource
/// administration events produce none.
///
/// `subject_of` resolves the subject for events that only carry ids.
pub fn notifications_for(
    events: &[Event],
    timestamp: Ms,
    subject_of: impl Fn(&Ulid) -> Option<String>,
) -> Vec<Notification> {
    let mut out = Vec::new();
    for event in events {
        let (kind, id, resource_id, subject) = match event {
            Event::ReservationConfirmed { id, resource_id, subject_id, .. } => {
                (NotificationKind::Confirmed, *id, *resource_id, Some(subject_id.clone()))
            }
            Event::ReservationWaitlisted { id, resource_id, subject_id, .. } => {
                (NotificationKind::Waitlisted, *id, *resource_id, Some(subject_id.clone()))
            }
            Event::ReservationPromoted { id, resource_id } => {
                (NotificationKind::Promoted, *id, *resource_id, subject_of(id))
            }
            Event::ReservationCancelled { id, resource_id } => {
                (NotificationKind::Cancelled, *id, *resource_id, subject_of(id))
            }
            Event::ReservationCompleted { id, resource_id } => {
                (NotificationKind::Completed, *id, *resource_id, subject_of(id))
            }
            _ => continue,
        };
        let Some(subject_id) = subject else { continue };
        out.push(Notification {
            kind,
            reservation_id: id,
            resource_id,
            subject_id,
            timestamp,
        });
    }
    out
}
