use tokio::sync::{oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::timestamp::{now_ms, today};

use super::catalog::claim_id;
use super::conflict::{check_no_overlap, optional_text, required_text, validate_timestamp};
use super::{Engine, EngineError, Entity, WalCommand};

fn validate_appointment(appointment: &Appointment) -> Result<(), EngineError> {
    validate_timestamp("start", appointment.start)?;
    if let Some(reason) = &appointment.reason
        && reason.len() > MAX_TEXT_LEN
    {
        return Err(EngineError::validation("reason too long"));
    }
    Ok(())
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, EngineError> {
    value.ok_or_else(|| EngineError::validation(format!("{field} is required")))
}

fn guard_for<'a>(
    guards: &'a mut [OwnedRwLockWriteGuard<Agenda>],
    doctor_id: Ulid,
) -> Option<&'a mut Agenda> {
    guards
        .iter_mut()
        .find(|g| g.doctor_id == doctor_id)
        .map(|g| &mut **g)
}

impl Engine {
    // ── Appointments ─────────────────────────────────────────────

    /// Check the candidate against its doctor's agenda and persist it.
    ///
    /// Without an id this books a new appointment of the configured length.
    /// With an id it rewrites that appointment in place, keeping its stored
    /// duration and any field the candidate leaves out. The read, the
    /// overlap check and the WAL append all happen under the doctor's agenda
    /// write lock, so two bookings for one doctor can never both pass.
    pub async fn validate_and_save(
        &self,
        candidate: AppointmentCandidate,
    ) -> Result<Appointment, EngineError> {
        let reason = match &candidate.reason {
            Some(r) => Some(optional_text("reason", r.as_deref(), MAX_TEXT_LEN)?),
            None => None,
        };
        let Some(id) = candidate.id else {
            let start = require(candidate.start, "start")?;
            let id = claim_id(candidate.new_id, Entity::Appointment, |id| {
                self.appointment_doctor.contains_key(id)
            })?;
            let appointment = Appointment {
                id,
                doctor_id: require(candidate.doctor_id, "doctor_id")?,
                patient_id: require(candidate.patient_id, "patient_id")?,
                start,
                duration: self.slot_ms,
                status: candidate.status.unwrap_or_default(),
                reason: reason.flatten(),
            };
            return self.insert_appointment(appointment).await;
        };
        if candidate.new_id.is_some_and(|new_id| new_id != id) {
            return Err(EngineError::validation("id cannot be changed"));
        }
        self.rewrite_appointment(id, |stored| {
            Ok(Appointment {
                id,
                doctor_id: candidate.doctor_id.unwrap_or(stored.doctor_id),
                patient_id: candidate.patient_id.unwrap_or(stored.patient_id),
                start: candidate.start.unwrap_or(stored.start),
                duration: stored.duration,
                status: candidate.status.unwrap_or(stored.status),
                reason: reason.clone().unwrap_or_else(|| stored.reason.clone()),
            })
        })
        .await
    }

    pub async fn create_appointment(
        &self,
        fields: AppointmentFields,
    ) -> Result<Appointment, EngineError> {
        self.validate_and_save(AppointmentCandidate::booking(fields))
            .await
    }

    /// Merge the present fields onto the stored appointment and re-run the
    /// overlap check.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        fields: AppointmentFields,
    ) -> Result<Appointment, EngineError> {
        self.validate_and_save(AppointmentCandidate::rewrite(id, fields))
            .await
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_appointment(&id).await?;
        let event = Event::AppointmentDeleted {
            id,
            doctor_id: guard.doctor_id,
        };
        self.persist_and_apply(&event, &mut [&mut *guard]).await
    }

    async fn insert_appointment(&self, appointment: Appointment) -> Result<Appointment, EngineError> {
        validate_appointment(&appointment)?;
        let mut guards = self.lock_agendas(&[appointment.doctor_id]).await?;
        let agenda = &mut *guards[0];
        if agenda.appointments.len() >= MAX_APPOINTMENTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many appointments for doctor"));
        }
        // Patient deletion holds every agenda, so this cannot go stale.
        if !self.patients.contains_key(&appointment.patient_id) {
            return Err(EngineError::NotFound(Entity::Patient, appointment.patient_id));
        }
        if self.appointment_doctor.contains_key(&appointment.id) {
            return Err(EngineError::AlreadyExists(
                Entity::Appointment,
                appointment.id.to_string(),
            ));
        }
        if appointment.occupies_slot() {
            check_no_overlap(agenda, Some(appointment.id), &appointment.span())?;
        }

        let event = Event::AppointmentSaved {
            appointment: appointment.clone(),
            previous_doctor: None,
        };
        self.persist_and_apply(&event, &mut [agenda]).await?;
        Ok(appointment)
    }

    /// Shared update path. `merge` turns the stored appointment into the
    /// proposed one; it runs again under the locks so the result always
    /// reflects the latest stored state.
    async fn rewrite_appointment(
        &self,
        id: Ulid,
        merge: impl Fn(&Appointment) -> Result<Appointment, EngineError>,
    ) -> Result<Appointment, EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let current_doctor = self
                .doctor_for_appointment(&id)
                .ok_or(EngineError::NotFound(Entity::Appointment, id))?;
            let agenda = self
                .get_agenda(&current_doctor)
                .ok_or(EngineError::NotFound(Entity::Appointment, id))?;
            let target_doctor = {
                let guard = agenda.read().await;
                match guard.get(id) {
                    Some(stored) => merge(stored)?.doctor_id,
                    None => continue,
                }
            };

            let mut guards = self
                .lock_agendas(&[current_doctor, target_doctor])
                .await
                .map_err(|e| match e {
                    EngineError::NotFound(Entity::Doctor, d) if d == current_doctor => {
                        EngineError::NotFound(Entity::Appointment, id)
                    }
                    other => other,
                })?;
            let Some(stored) = guard_for(&mut guards, current_doctor)
                .and_then(|a| a.get(id).cloned())
            else {
                // Moved or deleted while we waited.
                continue;
            };
            let proposed = merge(&stored)?;
            if proposed.doctor_id != target_doctor {
                continue;
            }
            validate_appointment(&proposed)?;
            if !self.patients.contains_key(&proposed.patient_id) {
                return Err(EngineError::NotFound(Entity::Patient, proposed.patient_id));
            }

            let moved = target_doctor != current_doctor;
            let Some(target) = guard_for(&mut guards, target_doctor) else {
                return Err(EngineError::NotFound(Entity::Doctor, target_doctor));
            };
            if moved && target.appointments.len() >= MAX_APPOINTMENTS_PER_DOCTOR {
                return Err(EngineError::LimitExceeded("too many appointments for doctor"));
            }
            if proposed.occupies_slot() {
                check_no_overlap(target, Some(id), &proposed.span())?;
            }

            let event = Event::AppointmentSaved {
                appointment: proposed.clone(),
                previous_doctor: Some(current_doctor),
            };
            let mut touched: Vec<&mut Agenda> = guards.iter_mut().map(|g| &mut **g).collect();
            self.persist_and_apply(&event, &mut touched).await?;
            return Ok(proposed);
        }
        Err(EngineError::NotFound(Entity::Appointment, id))
    }

    // ── Clinical histories ───────────────────────────────────────

    pub async fn create_history(&self, fields: HistoryFields) -> Result<ClinicalHistory, EngineError> {
        let appointment_id = require(fields.appointment_id, "appointment_id")?;
        let _guard = self.lock_appointment(&appointment_id).await?;
        if self.history_by_appointment.contains_key(&appointment_id) {
            return Err(EngineError::AlreadyExists(
                Entity::History,
                format!("appointment {appointment_id}"),
            ));
        }
        let id = claim_id(fields.id, Entity::History, |id| self.histories.contains_key(id))?;
        let history = ClinicalHistory {
            id,
            appointment_id,
            attended_on: fields.attended_on.unwrap_or_else(today),
            diagnosis: required_text(
                "diagnosis",
                fields.diagnosis.as_deref().unwrap_or_default(),
                MAX_TEXT_LEN,
            )?,
            treatment: optional_text("treatment", fields.treatment.flatten().as_deref(), MAX_TEXT_LEN)?,
        };
        self.persist_and_apply(&Event::HistorySaved(history.clone()), &mut [])
            .await?;
        Ok(history)
    }

    pub async fn update_history(
        &self,
        id: Ulid,
        fields: HistoryFields,
    ) -> Result<ClinicalHistory, EngineError> {
        let (current, _guard) = self.lock_history(id).await?;
        if fields.appointment_id.is_some_and(|a| a != current.appointment_id) {
            return Err(EngineError::validation("appointment_id cannot be changed"));
        }
        let history = ClinicalHistory {
            id,
            appointment_id: current.appointment_id,
            attended_on: fields.attended_on.unwrap_or(current.attended_on),
            diagnosis: match fields.diagnosis {
                Some(v) => required_text("diagnosis", &v, MAX_TEXT_LEN)?,
                None => current.diagnosis,
            },
            treatment: match fields.treatment {
                Some(v) => optional_text("treatment", v.as_deref(), MAX_TEXT_LEN)?,
                None => current.treatment,
            },
        };
        self.persist_and_apply(&Event::HistorySaved(history.clone()), &mut [])
            .await?;
        Ok(history)
    }

    pub async fn delete_history(&self, id: Ulid) -> Result<(), EngineError> {
        let (_, _guard) = self.lock_history(id).await?;
        self.persist_and_apply(&Event::HistoryDeleted { id }, &mut [])
            .await
    }

    /// Lock the agenda that owns a history, through its appointment.
    async fn lock_history(
        &self,
        id: Ulid,
    ) -> Result<(ClinicalHistory, OwnedRwLockWriteGuard<Agenda>), EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let appointment_id = self
                .histories
                .get(&id)
                .map(|h| h.appointment_id)
                .ok_or(EngineError::NotFound(Entity::History, id))?;
            let guard = self
                .lock_appointment(&appointment_id)
                .await
                .map_err(|_| EngineError::NotFound(Entity::History, id))?;
            if let Some(history) = self.histories.get(&id).map(|h| h.value().clone())
                && history.appointment_id == appointment_id
            {
                return Ok((history, guard));
            }
        }
        Err(EngineError::NotFound(Entity::History, id))
    }

    // ── Prescriptions ────────────────────────────────────────────

    pub async fn create_prescription(
        &self,
        fields: PrescriptionFields,
    ) -> Result<Prescription, EngineError> {
        let history_id = require(fields.history_id, "history_id")?;
        let (_, _guard) = self.lock_history(history_id).await?;
        if self.prescription_by_history.contains_key(&history_id) {
            return Err(EngineError::AlreadyExists(
                Entity::Prescription,
                format!("history {history_id}"),
            ));
        }
        let id = claim_id(fields.id, Entity::Prescription, |id| {
            self.prescriptions.contains_key(id)
        })?;
        let prescription = Prescription {
            id,
            history_id,
            issued_on: fields.issued_on.unwrap_or_else(today),
            medications: required_text(
                "medications",
                fields.medications.as_deref().unwrap_or_default(),
                MAX_TEXT_LEN,
            )?,
            instructions: optional_text(
                "instructions",
                fields.instructions.flatten().as_deref(),
                MAX_TEXT_LEN,
            )?,
        };
        self.persist_and_apply(&Event::PrescriptionSaved(prescription.clone()), &mut [])
            .await?;
        Ok(prescription)
    }

    pub async fn update_prescription(
        &self,
        id: Ulid,
        fields: PrescriptionFields,
    ) -> Result<Prescription, EngineError> {
        let (current, _guard) = self.lock_prescription(id).await?;
        if fields.history_id.is_some_and(|h| h != current.history_id) {
            return Err(EngineError::validation("history_id cannot be changed"));
        }
        let prescription = Prescription {
            id,
            history_id: current.history_id,
            issued_on: fields.issued_on.unwrap_or(current.issued_on),
            medications: match fields.medications {
                Some(v) => required_text("medications", &v, MAX_TEXT_LEN)?,
                None => current.medications,
            },
            instructions: match fields.instructions {
                Some(v) => optional_text("instructions", v.as_deref(), MAX_TEXT_LEN)?,
                None => current.instructions,
            },
        };
        self.persist_and_apply(&Event::PrescriptionSaved(prescription.clone()), &mut [])
            .await?;
        Ok(prescription)
    }

    pub async fn delete_prescription(&self, id: Ulid) -> Result<(), EngineError> {
        let (_, _guard) = self.lock_prescription(id).await?;
        self.persist_and_apply(&Event::PrescriptionDeleted { id }, &mut [])
            .await
    }

    async fn lock_prescription(
        &self,
        id: Ulid,
    ) -> Result<(Prescription, OwnedRwLockWriteGuard<Agenda>), EngineError> {
        let history_id = self
            .prescriptions
            .get(&id)
            .map(|p| p.history_id)
            .ok_or(EngineError::NotFound(Entity::Prescription, id))?;
        let (_, guard) = self
            .lock_history(history_id)
            .await
            .map_err(|_| EngineError::NotFound(Entity::Prescription, id))?;
        let prescription = self
            .prescriptions
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(Entity::Prescription, id))?;
        Ok((prescription, guard))
    }

    // ── Reminders ────────────────────────────────────────────────

    pub async fn create_reminder(&self, fields: ReminderFields) -> Result<Reminder, EngineError> {
        let appointment_id = require(fields.appointment_id, "appointment_id")?;
        let _guard = self.lock_appointment(&appointment_id).await?;
        let existing = self
            .reminders_by_appointment
            .get(&appointment_id)
            .map_or(0, |ids| ids.len());
        if existing >= MAX_REMINDERS_PER_APPOINTMENT {
            return Err(EngineError::LimitExceeded("too many reminders for appointment"));
        }
        let id = claim_id(fields.id, Entity::Reminder, |id| self.reminders.contains_key(id))?;
        let reminder = Reminder {
            id,
            appointment_id,
            channel: fields.channel.unwrap_or_default(),
            send_at: fields.send_at.map_or_else(now_ms, |t| t.0),
            sent: fields.sent.unwrap_or(false),
        };
        validate_timestamp("send_at", reminder.send_at)?;
        self.persist_and_apply(&Event::ReminderSaved(reminder.clone()), &mut [])
            .await?;
        Ok(reminder)
    }

    pub async fn update_reminder(
        &self,
        id: Ulid,
        fields: ReminderFields,
    ) -> Result<Reminder, EngineError> {
        let (current, _guard) = self.lock_reminder(id).await?;
        if fields.appointment_id.is_some_and(|a| a != current.appointment_id) {
            return Err(EngineError::validation("appointment_id cannot be changed"));
        }
        let reminder = Reminder {
            id,
            appointment_id: current.appointment_id,
            channel: fields.channel.unwrap_or(current.channel),
            send_at: fields.send_at.map_or(current.send_at, |t| t.0),
            sent: fields.sent.unwrap_or(current.sent),
        };
        validate_timestamp("send_at", reminder.send_at)?;
        self.persist_and_apply(&Event::ReminderSaved(reminder.clone()), &mut [])
            .await?;
        Ok(reminder)
    }

    pub async fn delete_reminder(&self, id: Ulid) -> Result<(), EngineError> {
        let (_, _guard) = self.lock_reminder(id).await?;
        self.persist_and_apply(&Event::ReminderDeleted { id }, &mut [])
            .await
    }

    async fn lock_reminder(
        &self,
        id: Ulid,
    ) -> Result<(Reminder, OwnedRwLockWriteGuard<Agenda>), EngineError> {
        let appointment_id = self
            .reminders
            .get(&id)
            .map(|r| r.appointment_id)
            .ok_or(EngineError::NotFound(Entity::Reminder, id))?;
        let guard = self
            .lock_appointment(&appointment_id)
            .await
            .map_err(|_| EngineError::NotFound(Entity::Reminder, id))?;
        let reminder = self
            .reminders
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(Entity::Reminder, id))?;
        Ok((reminder, guard))
    }

    // ── WAL maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild current state.
    /// Catalog writes are blocked and every agenda is read-locked for the
    /// duration, so the snapshot is consistent.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut doctor_ids: Vec<Ulid> = self.agendas.iter().map(|e| *e.key()).collect();
        doctor_ids.sort();
        let mut agendas: Vec<OwnedRwLockReadGuard<Agenda>> = Vec::with_capacity(doctor_ids.len());
        for id in &doctor_ids {
            if let Some(agenda) = self.get_agenda(id) {
                agendas.push(agenda.read_owned().await);
            }
        }

        let mut events = Vec::new();
        let mut specialties: Vec<Specialty> = self.specialties.iter().map(|e| e.value().clone()).collect();
        specialties.sort_by_key(|s| s.id);
        events.extend(specialties.into_iter().map(Event::SpecialtySaved));

        let mut doctors: Vec<Doctor> = self.doctors.iter().map(|e| e.value().clone()).collect();
        doctors.sort_by_key(|d| d.id);
        events.extend(doctors.into_iter().map(Event::DoctorSaved));

        let mut patients: Vec<Patient> = self.patients.iter().map(|e| e.value().clone()).collect();
        patients.sort_by_key(|p| p.id);
        events.extend(patients.into_iter().map(Event::PatientSaved));

        for agenda in &agendas {
            for appointment in &agenda.appointments {
                events.push(Event::AppointmentSaved {
                    appointment: appointment.clone(),
                    previous_doctor: None,
                });
            }
        }

        let mut histories: Vec<ClinicalHistory> = self.histories.iter().map(|e| e.value().clone()).collect();
        histories.sort_by_key(|h| h.id);
        events.extend(histories.into_iter().map(Event::HistorySaved));

        let mut prescriptions: Vec<Prescription> =
            self.prescriptions.iter().map(|e| e.value().clone()).collect();
        prescriptions.sort_by_key(|p| p.id);
        events.extend(prescriptions.into_iter().map(Event::PrescriptionSaved));

        let mut reminders: Vec<Reminder> = self.reminders.iter().map(|e| e.value().clone()).collect();
        reminders.sort_by_key(|r| r.id);
        events.extend(reminders.into_iter().map(Event::ReminderSaved));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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
