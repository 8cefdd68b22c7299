use std::sync::Arc;

use chrono::Weekday;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError, WalCommand};

pub(super) fn validate_text(
    value: &str,
    field: &'static str,
    max_len: usize,
) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}

pub(super) fn validate_email(email: &str) -> Result<(), EngineError> {
    validate_text(email, "email", MAX_EMAIL_LEN)?;
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(EngineError::Validation(format!("malformed email: {email}"))),
    }
}

pub(super) fn validate_reason(reason: &Option<String>) -> Result<(), EngineError> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => Err(EngineError::LimitExceeded("reason")),
        _ => Ok(()),
    }
}

impl Engine {
    pub async fn create_professional(
        &self,
        id: Ulid,
        email: String,
        name: String,
    ) -> Result<(), EngineError> {
        validate_email(&email)?;
        validate_text(&name, "name", MAX_NAME_LEN)?;

        let _catalog = self.catalog.lock().await;
        if self.professionals.len() >= MAX_PROFESSIONALS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        if self.professionals.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProfessionalCreated {
            id,
            email: email.clone(),
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        let ps = ProfessionalState::new(id, email, name);
        self.professionals.insert(id, Arc::new(RwLock::new(ps)));
        tracing::info!(professional_id = %id, "professional created");
        Ok(())
    }

    /// Append one window to a weekday. Overlapping windows are allowed; the
    /// slot generator deduplicates.
    pub async fn add_working_window(
        &self,
        professional_id: Ulid,
        weekday: Weekday,
        window: WallWindow,
    ) -> Result<(), EngineError> {
        let ps = self.get_professional(&professional_id)?;
        let mut guard = ps.write().await;
        let mut windows = guard.working_hours.windows(weekday).to_vec();
        if windows.len() >= MAX_WINDOWS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many working windows"));
        }
        windows.push(window);
        let event = Event::WorkingHoursSet {
            professional_id,
            weekday,
            windows,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Closed all day on `weekday`.
    pub async fn clear_working_day(
        &self,
        professional_id: Ulid,
        weekday: Weekday,
    ) -> Result<(), EngineError> {
        let ps = self.get_professional(&professional_id)?;
        let mut guard = ps.write().await;
        let event = Event::WorkingHoursSet {
            professional_id,
            weekday,
            windows: Vec::new(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn create_service(&self, service: Service) -> Result<(), EngineError> {
        validate_text(&service.name, "service name", MAX_NAME_LEN)?;
        if service.duration_ms <= 0 || service.duration_ms % MINUTE_MS != 0 {
            return Err(EngineError::Validation(
                "duration must be a positive number of minutes".into(),
            ));
        }
        if service.duration_ms > MAX_SERVICE_DURATION_MS {
            return Err(EngineError::LimitExceeded("service duration"));
        }
        if service.price_cents.is_some_and(|p| p < 0) {
            return Err(EngineError::Validation("price must not be negative".into()));
        }

        let _catalog = self.catalog.lock().await;
        if self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.services.contains_key(&service.id) {
            return Err(EngineError::AlreadyExists(service.id));
        }
        self.get_professional(&service.professional_id)?;

        let event = Event::ServiceCreated {
            service: service.clone(),
        };
        self.wal_append(&event).await?;
        self.services.insert(service.id, service);
        Ok(())
    }

    pub async fn add_block(
        &self,
        professional_id: Ulid,
        id: Ulid,
        kind: BlockKind,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        validate_reason(&reason)?;
        if let BlockKind::TimeSlot { span } = &kind {
            validate_span(span)?;
        }
        let ps = self.get_professional(&professional_id)?;
        let mut guard = ps.write().await;
        if guard.blocks.len() >= MAX_BLOCKS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many blocks"));
        }
        // Claim the id before the WAL await; a concurrent add with the same
        // id under another professional sees it taken.
        match self.index.owner.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(professional_id);
            }
        }
        let event = Event::BlockAdded {
            professional_id,
            block: Block {
                id,
                kind,
                reason,
                active: true,
            },
        };
        let result = self.persist_and_apply(&mut guard, &event).await;
        if result.is_err() {
            self.index.owner.remove(&id);
        }
        result
    }

    /// Soft delete. Returns the owning professional.
    pub async fn deactivate_block(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let professional_id = self
            .owner_of(&id)
            .ok_or_else(|| EngineError::not_found("block", id))?;
        let ps = self.get_professional(&professional_id)?;
        let mut guard = ps.write().await;
        match guard.blocks.iter().find(|b| b.id == id) {
            None => return Err(EngineError::not_found("block", id)),
            Some(b) if !b.active => return Ok(professional_id),
            Some(_) => {}
        }
        let event = Event::BlockDeactivated {
            id,
            professional_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(professional_id)
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let catalog = self.catalog.lock().await;
        let mut events = Vec::new();

        let professionals: Vec<_> = self
            .professionals
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut guards = Vec::with_capacity(professionals.len());
        for ps in &professionals {
            guards.push(ps.read().await);
        }

        for guard in &guards {
            events.push(Event::ProfessionalCreated {
                id: guard.id,
                email: guard.email.clone(),
                name: guard.name.clone(),
            });
            for weekday in [
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ] {
                events.push(Event::WorkingHoursSet {
                    professional_id: guard.id,
                    weekday,
                    windows: guard.working_hours.windows(weekday).to_vec(),
                });
            }
        }
        for entry in self.services.iter() {
            events.push(Event::ServiceCreated {
                service: entry.value().clone(),
            });
        }
        for guard in &guards {
            for block in &guard.blocks {
                events.push(Event::BlockAdded {
                    professional_id: guard.id,
                    block: block.clone(),
                });
            }
            for reservation in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
            }
        }

        // The catalogue lock and the read locks stay held until the writer has
        // swapped files, so no mutation can land in the old log after its
        // snapshot was taken.
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()));
        drop(guards);
        drop(catalog);
        result
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
