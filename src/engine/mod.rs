mod booking;
mod busy;
mod cancellation;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod slots;

pub use booking::BookingRequest;
pub(crate) use conflict::now_ms;
pub use busy::{BusyDay, local_busy};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::calendar::CalendarProvider;
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::Notifier;
use crate::wal::Wal;

pub type SharedProfessional = Arc<RwLock<ProfessionalState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal<Event>, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes do not leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Secondary indexes shared by every professional.
#[derive(Default)]
pub(super) struct EntityIndex {
    /// Reservation or block id → owning professional.
    owner: DashMap<Ulid, Ulid>,
    /// Cancellation token → reservation id. Unique.
    tokens: DashMap<String, Ulid>,
}

pub struct Engine {
    pub professionals: DashMap<Ulid, SharedProfessional>,
    pub services: DashMap<Ulid, Service>,
    pub(super) index: EntityIndex,
    /// Held by professional and service creation and by compaction, so a
    /// create never lands in a log that is about to be swapped out.
    pub(super) catalog: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) calendar: Arc<dyn CalendarProvider>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub config: EngineConfig,
}

/// Apply an event to one professional's state (caller holds the lock).
fn apply_to_professional(ps: &mut ProfessionalState, event: &Event, index: &EntityIndex) {
    match event {
        Event::WorkingHoursSet {
            weekday, windows, ..
        } => ps.working_hours.set(*weekday, windows.clone()),
        Event::BlockAdded { block, .. } => {
            index.owner.insert(block.id, ps.id);
            ps.blocks.push(block.clone());
        }
        Event::BlockDeactivated { id, .. } => {
            if let Some(b) = ps.blocks.iter_mut().find(|b| b.id == *id) {
                b.active = false;
            }
        }
        Event::ReservationCreated { reservation } => {
            index.owner.insert(reservation.id, ps.id);
            index
                .tokens
                .insert(reservation.cancellation_token.clone(), reservation.id);
            ps.insert_reservation(reservation.clone());
        }
        Event::ExternalEventLinked { id, event_id, .. } => {
            if let Some(r) = ps.reservation_mut(id) {
                r.external_event_id = Some(event_id.clone());
            }
        }
        Event::ReservationCancelled {
            id, at, reason, by, ..
        } => {
            if let Some(r) = ps.reservation_mut(id) {
                r.status = ReservationStatus::Cancelled {
                    at: *at,
                    reason: reason.clone(),
                    by: *by,
                };
            }
        }
        Event::ReservationClosed { id, outcome, .. } => {
            if let Some(r) = ps.reservation_mut(id) {
                r.status = match outcome {
                    CloseOutcome::Completed => ReservationStatus::Completed,
                    CloseOutcome::NoShow => ReservationStatus::NoShow,
                };
            }
        }
        // Handled at the DashMap level.
        Event::ProfessionalCreated { .. } | Event::ServiceCreated { .. } => {}
    }
}

/// Owning professional of a per-professional event.
fn event_professional_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::WorkingHoursSet {
            professional_id, ..
        }
        | Event::BlockAdded {
            professional_id, ..
        }
        | Event::BlockDeactivated {
            professional_id, ..
        }
        | Event::ExternalEventLinked {
            professional_id, ..
        }
        | Event::ReservationCancelled {
            professional_id, ..
        }
        | Event::ReservationClosed {
            professional_id, ..
        } => Some(*professional_id),
        Event::ReservationCreated { reservation } => Some(reservation.professional_id),
        Event::ProfessionalCreated { .. } | Event::ServiceCreated { .. } => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        calendar: Arc<dyn CalendarProvider>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events: Vec<Event> = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            professionals: DashMap::new(),
            services: DashMap::new(),
            index: EntityIndex::default(),
            catalog: Mutex::new(()),
            wal_tx,
            calendar,
            notifier,
            config,
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        // blocking_write would panic here: replay can run inside the runtime.
        for event in &events {
            match event {
                Event::ProfessionalCreated { id, email, name } => {
                    let ps = ProfessionalState::new(*id, email.clone(), name.clone());
                    engine.professionals.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::ServiceCreated { service } => {
                    engine.services.insert(service.id, service.clone());
                }
                other => {
                    if let Some(pid) = event_professional_id(other)
                        && let Some(entry) = engine.professionals.get(&pid)
                    {
                        let ps = entry.clone();
                        let mut guard = ps.try_write().expect("replay: uncontended write");
                        apply_to_professional(&mut guard, other, &engine.index);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn get_professional(&self, id: &Ulid) -> Result<SharedProfessional, EngineError> {
        self.professionals
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found("professional", id))
    }

    pub fn get_service(&self, id: &Ulid) -> Result<Service, EngineError> {
        self.services
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found("service", id))
    }

    pub(super) fn owner_of(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.index.owner.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn reservation_for_token(&self, token: &str) -> Option<Ulid> {
        self.index.tokens.get(token).map(|e| *e.value())
    }

    /// WAL-append, then apply. Nothing becomes visible unless the append is durable.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProfessionalState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_professional(ps, event, &self.index);
        Ok(())
    }
}
