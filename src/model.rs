use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::timestamp::Timestamp;

/// Unix milliseconds, the engine's only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    #[default]
    Pending,
    Confirmed,
    Attended,
    Cancelled,
    Absent,
}

impl AppointmentStatus {
    /// Terminal appointments release their slot.
    pub fn is_terminal(self) -> bool {
        matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::Absent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "PENDING",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Attended => "ATTENDED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::Absent => "ABSENT",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(AppointmentStatus::Pending),
            "CONFIRMED" => Ok(AppointmentStatus::Confirmed),
            "ATTENDED" => Ok(AppointmentStatus::Attended),
            "CANCELLED" => Ok(AppointmentStatus::Cancelled),
            "ABSENT" => Ok(AppointmentStatus::Absent),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderChannel {
    #[default]
    Mail,
    Sms,
    Notif,
}

impl ReminderChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            ReminderChannel::Mail => "MAIL",
            ReminderChannel::Sms => "SMS",
            ReminderChannel::Notif => "NOTIF",
        }
    }
}

impl FromStr for ReminderChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MAIL" => Ok(ReminderChannel::Mail),
            "SMS" => Ok(ReminderChannel::Sms),
            "NOTIF" => Ok(ReminderChannel::Notif),
            other => Err(format!("unknown reminder channel: {other}")),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specialty {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Ulid,
    /// Professional license number, unique per clinic.
    pub license: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub specialties: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Ulid,
    /// National identity document number, unique per clinic.
    pub national_id: String,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub start: Ms,
    pub duration: Ms,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
}

impl Appointment {
    pub fn end(&self) -> Ms {
        self.start + self.duration
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    /// Whether this appointment takes part in its doctor's overlap check.
    pub fn occupies_slot(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalHistory {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub attended_on: NaiveDate,
    pub diagnosis: String,
    pub treatment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prescription {
    pub id: Ulid,
    pub history_id: Ulid,
    pub issued_on: NaiveDate,
    pub medications: String,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub channel: ReminderChannel,
    pub send_at: Ms,
    /// Delivery is not implemented; this flag is only ever set by callers.
    pub sent: bool,
}

// ── Field sets for create / update ───────────────────────────────
//
// Every field is optional: create requires some of them, update merges
// whichever are present onto the stored record. Nullable columns use a
// double option so that an explicit `null` clears the value.

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpecialtyFields {
    pub id: Option<Ulid>,
    pub name: Option<String>,
    #[serde(deserialize_with = "present")]
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DoctorFields {
    pub id: Option<Ulid>,
    pub license: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    #[serde(deserialize_with = "present")]
    pub phone: Option<Option<String>>,
    pub specialties: Option<Vec<Ulid>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PatientFields {
    pub id: Option<Ulid>,
    pub national_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    #[serde(deserialize_with = "present")]
    pub email: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppointmentFields {
    pub id: Option<Ulid>,
    pub doctor_id: Option<Ulid>,
    pub patient_id: Option<Ulid>,
    pub start: Option<Timestamp>,
    pub status: Option<AppointmentStatus>,
    #[serde(deserialize_with = "present")]
    pub reason: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HistoryFields {
    pub id: Option<Ulid>,
    pub appointment_id: Option<Ulid>,
    pub attended_on: Option<NaiveDate>,
    pub diagnosis: Option<String>,
    #[serde(deserialize_with = "present")]
    pub treatment: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PrescriptionFields {
    pub id: Option<Ulid>,
    pub history_id: Option<Ulid>,
    pub issued_on: Option<NaiveDate>,
    pub medications: Option<String>,
    #[serde(deserialize_with = "present")]
    pub instructions: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReminderFields {
    pub id: Option<Ulid>,
    pub appointment_id: Option<Ulid>,
    pub channel: Option<ReminderChannel>,
    pub send_at: Option<Timestamp>,
    pub sent: Option<bool>,
}

/// Input to the scheduler's validate-and-save step. `id` is `None` for a new
/// appointment and names the stored one otherwise. Duration is never part of
/// the candidate.
///
/// A new booking needs `doctor_id`, `patient_id` and `start`; `new_id` lets
/// the caller pick its id. When rewriting, absent fields keep their stored
/// values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentCandidate {
    pub id: Option<Ulid>,
    pub new_id: Option<Ulid>,
    pub doctor_id: Option<Ulid>,
    pub patient_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub status: Option<AppointmentStatus>,
    pub reason: Option<Option<String>>,
}

impl AppointmentCandidate {
    /// A booking built from loose fields.
    pub fn booking(fields: AppointmentFields) -> Self {
        Self {
            id: None,
            new_id: fields.id,
            ..Self::from_fields(fields)
        }
    }

    /// A rewrite of appointment `id`. A different id in `fields` is kept as
    /// `new_id` so the save can refuse it.
    pub fn rewrite(id: Ulid, fields: AppointmentFields) -> Self {
        Self {
            id: Some(id),
            new_id: fields.id,
            ..Self::from_fields(fields)
        }
    }

    fn from_fields(fields: AppointmentFields) -> Self {
        Self {
            id: None,
            new_id: None,
            doctor_id: fields.doctor_id,
            patient_id: fields.patient_id,
            start: fields.start.map(|t| t.0),
            status: fields.status,
            reason: fields.reason,
        }
    }
}

// ── Agenda ───────────────────────────────────────────────────────

/// One doctor's appointments, cancelled and absent ones included.
/// This is the unit of locking for the overlap check.
#[derive(Debug, Clone)]
pub struct Agenda {
    pub doctor_id: Ulid,
    /// Set once the doctor is deleted so that writers still queued on the
    /// lock see a dead partition.
    pub closed: bool,
    /// Sorted by `start`.
    pub appointments: Vec<Appointment>,
}

impl Agenda {
    pub fn new(doctor_id: Ulid) -> Self {
        Self {
            doctor_id,
            closed: false,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    /// Replace an appointment, re-sorting if its start moved.
    pub fn upsert(&mut self, appointment: Appointment) {
        self.remove(appointment.id);
        self.insert(appointment);
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// Appointments with `start_gt < start < start_lt`.
    pub fn starting_between(&self, start_lt: Ms, start_gt: Ms) -> impl Iterator<Item = &Appointment> {
        let right_bound = self.appointments.partition_point(|a| a.start < start_lt);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.start > start_gt)
    }

    /// Appointments whose own `[start, end)` overlaps `query`, regardless of
    /// status. Everything at or after the partition point starts at or after
    /// `query.end` and cannot overlap.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self.appointments.partition_point(|a| a.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.end() > query.start)
    }
}

/// WAL record format. One event per logical write: a delete carries its
/// cascade, which replay re-derives from the state it has built so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpecialtySaved(Specialty),
    /// Also strips the specialty from every doctor.
    SpecialtyDeleted { id: Ulid },
    DoctorSaved(Doctor),
    /// Also drops the doctor's agenda and everything its appointments own.
    DoctorDeleted { id: Ulid },
    PatientSaved(Patient),
    /// Also drops the patient's appointments in every agenda.
    PatientDeleted { id: Ulid },
    /// Insert or update. When `previous_doctor` differs from the
    /// appointment's doctor the appointment moved between agendas.
    AppointmentSaved {
        appointment: Appointment,
        previous_doctor: Option<Ulid>,
    },
    /// Also drops the appointment's history, prescription and reminders.
    AppointmentDeleted { id: Ulid, doctor_id: Ulid },
    HistorySaved(ClinicalHistory),
    /// Also drops the history's prescription.
    HistoryDeleted { id: Ulid },
    PrescriptionSaved(Prescription),
    PrescriptionDeleted { id: Ulid },
    ReminderSaved(Reminder),
    ReminderDeleted { id: Ulid },
}
