//! Per-entity data-access handles over one [`Engine`].
//!
//! Every handle borrows the engine and speaks the same create / get /
//! update / delete / list contract, so the console and the HTTP layer can
//! drive any table the same way. Dispatch is static: callers name the handle.

use ulid::Ulid;

use crate::model::*;

use super::{AppointmentFilter, Engine, EngineError};

#[allow(async_fn_in_trait)]
pub trait Repository {
    type Record;
    type Fields;

    async fn create(&self, fields: Self::Fields) -> Result<Self::Record, EngineError>;
    async fn get(&self, id: Ulid) -> Option<Self::Record>;
    async fn update(&self, id: Ulid, fields: Self::Fields) -> Result<Self::Record, EngineError>;
    async fn delete(&self, id: Ulid) -> Result<(), EngineError>;
    /// All records in the entity's default order.
    async fn list(&self) -> Vec<Self::Record>;
}

pub struct Specialties<'a>(pub &'a Engine);
pub struct Doctors<'a>(pub &'a Engine);
pub struct Patients<'a>(pub &'a Engine);
pub struct Appointments<'a>(pub &'a Engine);
pub struct Histories<'a>(pub &'a Engine);
pub struct Prescriptions<'a>(pub &'a Engine);
pub struct Reminders<'a>(pub &'a Engine);

/// Wire a handle to the engine's synchronous getters and listers.
macro_rules! record_repository {
    ($handle:ident, $record:ty, $fields:ty, $create:ident, $get:ident, $update:ident, $delete:ident, $list:ident) => {
        impl Repository for $handle<'_> {
            type Record = $record;
            type Fields = $fields;

            async fn create(&self, fields: $fields) -> Result<$record, EngineError> {
                self.0.$create(fields).await
            }

            async fn get(&self, id: Ulid) -> Option<$record> {
                self.0.$get(&id)
            }

            async fn update(&self, id: Ulid, fields: $fields) -> Result<$record, EngineError> {
                self.0.$update(id, fields).await
            }

            async fn delete(&self, id: Ulid) -> Result<(), EngineError> {
                self.0.$delete(id).await
            }

            async fn list(&self) -> Vec<$record> {
                self.0.$list()
            }
        }
    };
}

record_repository!(
    Specialties, Specialty, SpecialtyFields,
    create_specialty, get_specialty, update_specialty, delete_specialty, list_specialties
);
record_repository!(
    Doctors, Doctor, DoctorFields,
    create_doctor, get_doctor, update_doctor, delete_doctor, list_doctors
);
record_repository!(
    Patients, Patient, PatientFields,
    create_patient, get_patient, update_patient, delete_patient, list_patients
);
record_repository!(
    Histories, ClinicalHistory, HistoryFields,
    create_history, get_history, update_history, delete_history, list_histories
);
record_repository!(
    Prescriptions, Prescription, PrescriptionFields,
    create_prescription, get_prescription, update_prescription, delete_prescription, list_prescriptions
);
record_repository!(
    Reminders, Reminder, ReminderFields,
    create_reminder, get_reminder, update_reminder, delete_reminder, list_reminders
);

// Appointments live behind agenda locks, so reads are async.
impl Repository for Appointments<'_> {
    type Record = Appointment;
    type Fields = AppointmentFields;

    async fn create(&self, fields: AppointmentFields) -> Result<Appointment, EngineError> {
        self.0.create_appointment(fields).await
    }

    async fn get(&self, id: Ulid) -> Option<Appointment> {
        self.0.get_appointment(&id).await
    }

    async fn update(&self, id: Ulid, fields: AppointmentFields) -> Result<Appointment, EngineError> {
        self.0.update_appointment(id, fields).await
    }

    async fn delete(&self, id: Ulid) -> Result<(), EngineError> {
        self.0.delete_appointment(id).await
    }

    async fn list(&self) -> Vec<Appointment> {
        self.0.list_appointments(&AppointmentFilter::default()).await
    }
}
