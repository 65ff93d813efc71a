use std::cmp::Reverse;

use ulid::Ulid;

use crate::limits::MAX_RELOCK_ATTEMPTS;
use crate::model::*;

use super::{Engine, EngineError, Entity};

/// Optional equality filters for listing appointments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct AppointmentFilter {
    pub doctor_id: Option<Ulid>,
    pub patient_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
}

impl AppointmentFilter {
    pub fn matches(&self, appointment: &Appointment) -> bool {
        self.doctor_id.is_none_or(|d| d == appointment.doctor_id)
            && self.patient_id.is_none_or(|p| p == appointment.patient_id)
            && self.status.is_none_or(|s| s == appointment.status)
    }
}

impl Engine {
    pub fn get_specialty(&self, id: &Ulid) -> Option<Specialty> {
        self.specialties.get(id).map(|e| e.value().clone())
    }

    /// Ordered by name.
    pub fn list_specialties(&self) -> Vec<Specialty> {
        let mut out: Vec<Specialty> = self.specialties.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub fn get_doctor(&self, id: &Ulid) -> Option<Doctor> {
        self.doctors.get(id).map(|e| e.value().clone())
    }

    /// Ordered by last name, then first name.
    pub fn list_doctors(&self) -> Vec<Doctor> {
        let mut out: Vec<Doctor> = self.doctors.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| {
            (&a.last_name, &a.first_name, a.id).cmp(&(&b.last_name, &b.first_name, b.id))
        });
        out
    }

    pub fn get_patient(&self, id: &Ulid) -> Option<Patient> {
        self.patients.get(id).map(|e| e.value().clone())
    }

    /// Ordered by last name, then first name.
    pub fn list_patients(&self) -> Vec<Patient> {
        let mut out: Vec<Patient> = self.patients.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| {
            (&a.last_name, &a.first_name, a.id).cmp(&(&b.last_name, &b.first_name, b.id))
        });
        out
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        // An update can move the appointment to another agenda between the
        // index lookup and the read; follow it.
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let doctor_id = self.doctor_for_appointment(id)?;
            let agenda = self.get_agenda(&doctor_id)?;
            let guard = agenda.read().await;
            if let Some(found) = guard.get(*id) {
                return Some(found.clone());
            }
        }
        None
    }

    /// Ordered by start. Reads one agenda at a time.
    pub async fn list_appointments(&self, filter: &AppointmentFilter) -> Vec<Appointment> {
        let agendas: Vec<_> = match filter.doctor_id {
            Some(doctor_id) => self.get_agenda(&doctor_id).into_iter().collect(),
            None => self.agendas.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for agenda in agendas {
            let guard = agenda.read().await;
            out.extend(guard.appointments.iter().filter(|a| filter.matches(a)).cloned());
        }
        out.sort_by_key(|a| (a.start, a.id));
        out
    }

    /// Appointments of `doctor_id` with `start_gt < start < start_lt`, any
    /// status, ordered by start.
    pub async fn find_by_doctor_in_range(
        &self,
        doctor_id: Ulid,
        start_lt: Ms,
        start_gt: Ms,
    ) -> Result<Vec<Appointment>, EngineError> {
        let agenda = self
            .get_agenda(&doctor_id)
            .ok_or(EngineError::NotFound(Entity::Doctor, doctor_id))?;
        let guard = agenda.read().await;
        Ok(guard.starting_between(start_lt, start_gt).cloned().collect())
    }

    pub fn get_history(&self, id: &Ulid) -> Option<ClinicalHistory> {
        self.histories.get(id).map(|e| e.value().clone())
    }

    pub fn history_for_appointment(&self, appointment_id: &Ulid) -> Option<ClinicalHistory> {
        let id = *self.history_by_appointment.get(appointment_id)?;
        self.get_history(&id)
    }

    /// Most recent first.
    pub fn list_histories(&self) -> Vec<ClinicalHistory> {
        let mut out: Vec<ClinicalHistory> = self.histories.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|h| (Reverse(h.attended_on), h.id));
        out
    }

    pub fn get_prescription(&self, id: &Ulid) -> Option<Prescription> {
        self.prescriptions.get(id).map(|e| e.value().clone())
    }

    /// Most recent first.
    pub fn list_prescriptions(&self) -> Vec<Prescription> {
        let mut out: Vec<Prescription> = self.prescriptions.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| (Reverse(p.issued_on), p.id));
        out
    }

    pub fn get_reminder(&self, id: &Ulid) -> Option<Reminder> {
        self.reminders.get(id).map(|e| e.value().clone())
    }

    /// Soonest first.
    pub fn list_reminders(&self) -> Vec<Reminder> {
        let mut out: Vec<Reminder> = self.reminders.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|r| (r.send_at, r.id));
        out
    }

    pub fn reminders_for_appointment(&self, appointment_id: &Ulid) -> Vec<Reminder> {
        let ids = match self.reminders_by_appointment.get(appointment_id) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        let mut out: Vec<Reminder> = ids.iter().filter_map(|id| self.get_reminder(id)).collect();
        out.sort_by_key(|r| (r.send_at, r.id));
        out
    }
}
