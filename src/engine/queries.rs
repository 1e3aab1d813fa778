use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// The subject's active reservation on the resource, else its most
    /// recent terminal one.
    pub async fn get_reservation(
        &self,
        resource_id: Ulid,
        subject_id: &str,
    ) -> Result<Option<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.latest_for_subject(subject_id).cloned())
    }

    pub async fn get_reservation_by_id(
        &self,
        reservation_id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let resource_id = self
            .get_resource_for_reservation(&reservation_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;
        let guard = rs.read().await;
        guard
            .reservation(&reservation_id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(reservation_id))
    }

    /// Every reservation on the resource, oldest first.
    pub async fn list_reservations(
        &self,
        resource_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.reservations_by_creation().into_iter().cloned().collect())
    }

    /// Waitlisted reservations in promotion order.
    pub async fn list_waitlist(&self, resource_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.waitlist().cloned().collect())
    }

    pub async fn get_availability(&self, resource_id: Ulid) -> Result<Availability, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(Availability {
            resource_id,
            capacity: guard.capacity,
            confirmed_count: guard.confirmed_count(),
            waitlist_length: guard.waitlist_len(),
            open: guard.open,
        })
    }

    pub async fn get_resource_info(&self, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::ResourceNotFound(resource_id));
        }
        Ok(info_of(&guard))
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let rows: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(rows.len());
        for rs in rows {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            out.push(info_of(&guard));
        }
        out.sort_by_key(|r| r.id);
        out
    }
}

fn info_of(rs: &ResourceState) -> ResourceInfo {
    ResourceInfo {
        id: rs.id,
        name: rs.name.clone(),
        capacity: rs.capacity,
        overflow: rs.overflow,
        open: rs.open,
    }
}
