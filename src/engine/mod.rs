mod catalog;
mod conflict;
mod error;
mod mutations;
mod queries;
mod repo;

pub use conflict::find_overlap;
pub use error::{EngineError, Entity};
pub use queries::AppointmentFilter;
pub use repo::{
    Appointments, Doctors, Histories, Patients, Prescriptions, Reminders, Repository, Specialties,
};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_RELOCK_ATTEMPTS;
use crate::model::*;
use crate::wal::Wal;

pub type SharedAgenda = Arc<RwLock<Agenda>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then fsyncs once for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
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
                    // Flush what we have before a compaction or counter read.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch; the whole batch is reported failed either way.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

fn agenda_of<'a>(agendas: &'a mut [&mut Agenda], doctor_id: Ulid) -> Option<&'a mut Agenda> {
    agendas
        .iter_mut()
        .find(|a| a.doctor_id == doctor_id)
        .map(|a| &mut **a)
}

/// One clinic's scheduling state.
///
/// Specialties, doctors and patients are catalog records; their writes are
/// serialized by `catalog_lock`. Appointments live in per-doctor agendas, and
/// every write that touches an appointment or anything it owns (history,
/// prescription, reminders) holds that doctor's agenda write lock. Lock
/// order is always catalog first, then agendas by ascending doctor id.
pub struct Engine {
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Duration given to new appointments.
    pub(super) slot_ms: Ms,
    pub(super) catalog_lock: Mutex<()>,
    pub(super) specialties: DashMap<Ulid, Specialty>,
    pub(super) doctors: DashMap<Ulid, Doctor>,
    pub(super) patients: DashMap<Ulid, Patient>,
    pub(super) agendas: DashMap<Ulid, SharedAgenda>,
    /// Reverse lookup: appointment id → doctor id
    pub(super) appointment_doctor: DashMap<Ulid, Ulid>,
    pub(super) histories: DashMap<Ulid, ClinicalHistory>,
    pub(super) prescriptions: DashMap<Ulid, Prescription>,
    pub(super) reminders: DashMap<Ulid, Reminder>,
    /// appointment id → history id (one-to-one)
    pub(super) history_by_appointment: DashMap<Ulid, Ulid>,
    /// history id → prescription id (one-to-one)
    pub(super) prescription_by_history: DashMap<Ulid, Ulid>,
    pub(super) reminders_by_appointment: DashMap<Ulid, Vec<Ulid>>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, slot_ms: Ms) -> io::Result<Self> {
        let (events, wal) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            wal_tx,
            slot_ms,
            catalog_lock: Mutex::new(()),
            specialties: DashMap::new(),
            doctors: DashMap::new(),
            patients: DashMap::new(),
            agendas: DashMap::new(),
            appointment_doctor: DashMap::new(),
            histories: DashMap::new(),
            prescriptions: DashMap::new(),
            reminders: DashMap::new(),
            history_by_appointment: DashMap::new(),
            prescription_by_history: DashMap::new(),
            reminders_by_appointment: DashMap::new(),
        };

        // Replay into plain agendas; nothing else can see the engine yet, so
        // they are only wrapped in locks once the log has been consumed.
        let mut agendas: HashMap<Ulid, Agenda> = HashMap::new();
        for event in &events {
            match event {
                Event::DoctorSaved(doctor) => {
                    agendas
                        .entry(doctor.id)
                        .or_insert_with(|| Agenda::new(doctor.id));
                    engine.apply(event, &mut []);
                }
                Event::DoctorDeleted { id } => {
                    let mut removed = agendas.remove(id);
                    engine.apply(event, &mut removed.iter_mut().collect::<Vec<_>>());
                }
                Event::PatientDeleted { .. } => {
                    engine.apply(event, &mut agendas.values_mut().collect::<Vec<_>>());
                }
                Event::AppointmentSaved { appointment, previous_doctor } => {
                    let mut previous = previous_doctor
                        .filter(|p| *p != appointment.doctor_id)
                        .and_then(|p| agendas.remove(&p));
                    let mut touched: Vec<&mut Agenda> = previous.iter_mut().collect();
                    touched.extend(agendas.get_mut(&appointment.doctor_id));
                    engine.apply(event, &mut touched);
                    if let Some(prev) = previous {
                        agendas.insert(prev.doctor_id, prev);
                    }
                }
                Event::AppointmentDeleted { doctor_id, .. } => {
                    engine.apply(event, &mut agendas.get_mut(doctor_id).into_iter().collect::<Vec<_>>());
                }
                other => engine.apply(other, &mut []),
            }
        }
        for (id, agenda) in agendas {
            engine.agendas.insert(id, Arc::new(RwLock::new(agenda)));
        }

        Ok(engine)
    }

    /// Length given to new appointments, in milliseconds.
    pub fn slot_ms(&self) -> Ms {
        self.slot_ms
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply. State only changes once the event is durable.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        agendas: &mut [&mut Agenda],
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(event, agendas);
        Ok(())
    }

    /// Apply an event to in-memory state, cascades included. `agendas` are
    /// the agendas the event touches, write-locked by the caller: the
    /// appointment's doctor (and, for a move, the one it leaves), the
    /// deleted doctor, or every agenda for a deleted patient.
    pub(super) fn apply(&self, event: &Event, agendas: &mut [&mut Agenda]) {
        match event {
            Event::SpecialtySaved(specialty) => {
                self.specialties.insert(specialty.id, specialty.clone());
            }
            Event::SpecialtyDeleted { id } => {
                self.specialties.remove(id);
                for mut doctor in self.doctors.iter_mut() {
                    doctor.specialties.retain(|s| s != id);
                }
            }
            Event::DoctorSaved(doctor) => {
                self.doctors.insert(doctor.id, doctor.clone());
            }
            Event::DoctorDeleted { id } => {
                if let Some(agenda) = agenda_of(agendas, *id) {
                    for appointment in std::mem::take(&mut agenda.appointments) {
                        self.forget_appointment(&appointment.id);
                    }
                    agenda.closed = true;
                }
                self.doctors.remove(id);
                self.agendas.remove(id);
            }
            Event::PatientSaved(patient) => {
                self.patients.insert(patient.id, patient.clone());
            }
            Event::PatientDeleted { id } => {
                for agenda in agendas.iter_mut() {
                    let owned: Vec<Ulid> = agenda
                        .appointments
                        .iter()
                        .filter(|a| a.patient_id == *id)
                        .map(|a| a.id)
                        .collect();
                    for appointment_id in owned {
                        agenda.remove(appointment_id);
                        self.forget_appointment(&appointment_id);
                    }
                }
                self.patients.remove(id);
            }
            Event::AppointmentSaved { appointment, previous_doctor } => {
                if let Some(prev) = previous_doctor.filter(|p| *p != appointment.doctor_id)
                    && let Some(agenda) = agenda_of(agendas, prev)
                {
                    agenda.remove(appointment.id);
                }
                if let Some(agenda) = agenda_of(agendas, appointment.doctor_id) {
                    agenda.upsert(appointment.clone());
                }
                self.appointment_doctor
                    .insert(appointment.id, appointment.doctor_id);
            }
            Event::AppointmentDeleted { id, doctor_id } => {
                if let Some(agenda) = agenda_of(agendas, *doctor_id) {
                    agenda.remove(*id);
                }
                self.forget_appointment(id);
            }
            Event::HistorySaved(history) => {
                self.history_by_appointment
                    .insert(history.appointment_id, history.id);
                self.histories.insert(history.id, history.clone());
            }
            Event::HistoryDeleted { id } => {
                if let Some(history) = self.histories.get(id).map(|h| h.appointment_id) {
                    self.history_by_appointment.remove(&history);
                }
                self.drop_history(*id);
            }
            Event::PrescriptionSaved(prescription) => {
                self.prescription_by_history
                    .insert(prescription.history_id, prescription.id);
                self.prescriptions
                    .insert(prescription.id, prescription.clone());
            }
            Event::PrescriptionDeleted { id } => {
                if let Some((_, prescription)) = self.prescriptions.remove(id) {
                    self.prescription_by_history.remove(&prescription.history_id);
                }
            }
            Event::ReminderSaved(reminder) => {
                let mut ids = self
                    .reminders_by_appointment
                    .entry(reminder.appointment_id)
                    .or_default();
                if !ids.contains(&reminder.id) {
                    ids.push(reminder.id);
                }
                drop(ids);
                self.reminders.insert(reminder.id, reminder.clone());
            }
            Event::ReminderDeleted { id } => {
                if let Some((_, reminder)) = self.reminders.remove(id)
                    && let Some(mut ids) = self.reminders_by_appointment.get_mut(&reminder.appointment_id)
                {
                    ids.retain(|r| r != id);
                }
            }
        }
    }

    /// Drop the lookups and records an appointment owns: its history (and
    /// that history's prescription) and its reminders.
    fn forget_appointment(&self, id: &Ulid) {
        self.appointment_doctor.remove(id);
        if let Some((_, history_id)) = self.history_by_appointment.remove(id) {
            self.drop_history(history_id);
        }
        if let Some((_, reminder_ids)) = self.reminders_by_appointment.remove(id) {
            for reminder_id in reminder_ids {
                self.reminders.remove(&reminder_id);
            }
        }
    }

    /// Remove a history and the prescription it owns.
    fn drop_history(&self, history_id: Ulid) {
        self.histories.remove(&history_id);
        if let Some((_, prescription_id)) = self.prescription_by_history.remove(&history_id) {
            self.prescriptions.remove(&prescription_id);
        }
    }

    pub fn get_agenda(&self, doctor_id: &Ulid) -> Option<SharedAgenda> {
        self.agendas.get(doctor_id).map(|e| e.value().clone())
    }

    pub fn doctor_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_doctor.get(appointment_id).map(|e| *e.value())
    }

    /// Acquire write locks on several agendas in ascending doctor-id order.
    /// Guards come back in that same order.
    pub(super) async fn lock_agendas(
        &self,
        doctor_ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<Agenda>>, EngineError> {
        let mut ids = doctor_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let agenda = self
                .get_agenda(&id)
                .ok_or(EngineError::NotFound(Entity::Doctor, id))?;
            let guard = agenda.write_owned().await;
            if guard.closed {
                return Err(EngineError::NotFound(Entity::Doctor, id));
            }
            guards.push(guard);
        }
        Ok(guards)
    }

    /// Lookup appointment → doctor, acquire that agenda's write lock and
    /// confirm the appointment is still there. An update that moved it to
    /// another doctor in the meantime sends us around again.
    pub(super) async fn lock_appointment(
        &self,
        appointment_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Agenda>, EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let doctor_id = self
                .doctor_for_appointment(appointment_id)
                .ok_or(EngineError::NotFound(Entity::Appointment, *appointment_id))?;
            let agenda = self
                .get_agenda(&doctor_id)
                .ok_or(EngineError::NotFound(Entity::Appointment, *appointment_id))?;
            let guard = agenda.write_owned().await;
            if !guard.closed && guard.get(*appointment_id).is_some() {
                return Ok(guard);
            }
        }
        Err(EngineError::NotFound(Entity::Appointment, *appointment_id))
    }
}
