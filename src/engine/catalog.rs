use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::timestamp::today;

use super::conflict::{optional_text, required_text, validate_email};
use super::{Engine, EngineError, Entity};

/// Use the caller's id if it is free, otherwise mint one.
pub(super) fn claim_id(
    requested: Option<Ulid>,
    entity: Entity,
    taken: impl Fn(&Ulid) -> bool,
) -> Result<Ulid, EngineError> {
    match requested {
        Some(id) if taken(&id) => Err(EngineError::AlreadyExists(entity, id.to_string())),
        Some(id) => Ok(id),
        None => Ok(Ulid::new()),
    }
}

/// Apply an optional replacement for a nullable text field.
fn merge_optional(
    field: &str,
    update: Option<Option<String>>,
    current: Option<String>,
    max: usize,
) -> Result<Option<String>, EngineError> {
    match update {
        Some(value) => optional_text(field, value.as_deref(), max),
        None => Ok(current),
    }
}

fn dedup_ids(ids: Vec<Ulid>) -> Vec<Ulid> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

impl Engine {
    // ── Specialties ──────────────────────────────────────────────

    pub async fn create_specialty(&self, fields: SpecialtyFields) -> Result<Specialty, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if self.specialties.len() >= MAX_SPECIALTIES {
            return Err(EngineError::LimitExceeded("too many specialties"));
        }
        let id = claim_id(fields.id, Entity::Specialty, |id| self.specialties.contains_key(id))?;
        let specialty = Specialty {
            id,
            name: required_text("name", fields.name.as_deref().unwrap_or_default(), MAX_NAME_LEN)?,
            description: optional_text(
                "description",
                fields.description.flatten().as_deref(),
                MAX_TEXT_LEN,
            )?,
        };
        self.check_specialty_unique(&specialty)?;
        self.persist_and_apply(&Event::SpecialtySaved(specialty.clone()), &mut [])
            .await?;
        Ok(specialty)
    }

    pub async fn update_specialty(
        &self,
        id: Ulid,
        fields: SpecialtyFields,
    ) -> Result<Specialty, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let current = self
            .specialties
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(Entity::Specialty, id))?;
        let specialty = Specialty {
            id,
            name: match fields.name {
                Some(name) => required_text("name", &name, MAX_NAME_LEN)?,
                None => current.name,
            },
            description: merge_optional(
                "description",
                fields.description,
                current.description,
                MAX_TEXT_LEN,
            )?,
        };
        self.check_specialty_unique(&specialty)?;
        self.persist_and_apply(&Event::SpecialtySaved(specialty.clone()), &mut [])
            .await?;
        Ok(specialty)
    }

    /// Doctors keep practicing; they just lose this specialty.
    pub async fn delete_specialty(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.specialties.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Specialty, id));
        }
        self.persist_and_apply(&Event::SpecialtyDeleted { id }, &mut [])
            .await
    }

    fn check_specialty_unique(&self, specialty: &Specialty) -> Result<(), EngineError> {
        let taken = self
            .specialties
            .iter()
            .any(|s| s.id != specialty.id && s.name == specialty.name);
        if taken {
            return Err(EngineError::AlreadyExists(
                Entity::Specialty,
                format!("name {}", specialty.name),
            ));
        }
        Ok(())
    }

    // ── Doctors ──────────────────────────────────────────────────

    pub async fn create_doctor(&self, fields: DoctorFields) -> Result<Doctor, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if self.doctors.len() >= MAX_DOCTORS {
            return Err(EngineError::LimitExceeded("too many doctors"));
        }
        let id = claim_id(fields.id, Entity::Doctor, |id| self.doctors.contains_key(id))?;
        let doctor = Doctor {
            id,
            license: required_text(
                "license",
                fields.license.as_deref().unwrap_or_default(),
                MAX_LICENSE_LEN,
            )?,
            first_name: required_text(
                "first_name",
                fields.first_name.as_deref().unwrap_or_default(),
                MAX_NAME_LEN,
            )?,
            last_name: required_text(
                "last_name",
                fields.last_name.as_deref().unwrap_or_default(),
                MAX_NAME_LEN,
            )?,
            email: validate_email("email", fields.email.as_deref().unwrap_or_default())?,
            phone: optional_text("phone", fields.phone.flatten().as_deref(), MAX_PHONE_LEN)?,
            specialties: dedup_ids(fields.specialties.unwrap_or_default()),
        };
        self.check_doctor(&doctor)?;
        self.persist_and_apply(&Event::DoctorSaved(doctor.clone()), &mut [])
            .await?;
        self.agendas
            .insert(id, Arc::new(RwLock::new(Agenda::new(id))));
        info!(doctor_id = %id, "doctor registered");
        Ok(doctor)
    }

    pub async fn update_doctor(&self, id: Ulid, fields: DoctorFields) -> Result<Doctor, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let current = self
            .doctors
            .get(&id)
            .map(|d| d.value().clone())
            .ok_or(EngineError::NotFound(Entity::Doctor, id))?;
        let doctor = Doctor {
            id,
            license: match fields.license {
                Some(v) => required_text("license", &v, MAX_LICENSE_LEN)?,
                None => current.license,
            },
            first_name: match fields.first_name {
                Some(v) => required_text("first_name", &v, MAX_NAME_LEN)?,
                None => current.first_name,
            },
            last_name: match fields.last_name {
                Some(v) => required_text("last_name", &v, MAX_NAME_LEN)?,
                None => current.last_name,
            },
            email: match fields.email {
                Some(v) => validate_email("email", &v)?,
                None => current.email,
            },
            phone: merge_optional("phone", fields.phone, current.phone, MAX_PHONE_LEN)?,
            specialties: fields
                .specialties
                .map(dedup_ids)
                .unwrap_or(current.specialties),
        };
        self.check_doctor(&doctor)?;
        self.persist_and_apply(&Event::DoctorSaved(doctor.clone()), &mut [])
            .await
            .map(|()| doctor)
    }

    /// One logged event takes the doctor and every appointment in their
    /// agenda, along with what those appointments own.
    pub async fn delete_doctor(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.doctors.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Doctor, id));
        }
        let mut guards = self.lock_agendas(&[id]).await?;
        self.persist_and_apply(&Event::DoctorDeleted { id }, &mut [&mut *guards[0]])
            .await?;
        info!(doctor_id = %id, "doctor removed");
        Ok(())
    }

    fn check_doctor(&self, doctor: &Doctor) -> Result<(), EngineError> {
        if doctor.specialties.len() > MAX_SPECIALTIES_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many specialties for one doctor"));
        }
        for specialty in &doctor.specialties {
            if !self.specialties.contains_key(specialty) {
                return Err(EngineError::NotFound(Entity::Specialty, *specialty));
            }
        }
        for other in self.doctors.iter().filter(|d| d.id != doctor.id) {
            if other.license == doctor.license {
                return Err(EngineError::AlreadyExists(
                    Entity::Doctor,
                    format!("license {}", doctor.license),
                ));
            }
            if other.email.eq_ignore_ascii_case(&doctor.email) {
                return Err(EngineError::AlreadyExists(
                    Entity::Doctor,
                    format!("email {}", doctor.email),
                ));
            }
        }
        Ok(())
    }

    // ── Patients ─────────────────────────────────────────────────

    pub async fn create_patient(&self, fields: PatientFields) -> Result<Patient, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if self.patients.len() >= MAX_PATIENTS {
            return Err(EngineError::LimitExceeded("too many patients"));
        }
        let id = claim_id(fields.id, Entity::Patient, |id| self.patients.contains_key(id))?;
        let patient = Patient {
            id,
            national_id: required_text(
                "national_id",
                fields.national_id.as_deref().unwrap_or_default(),
                MAX_NATIONAL_ID_LEN,
            )?,
            first_name: required_text(
                "first_name",
                fields.first_name.as_deref().unwrap_or_default(),
                MAX_NAME_LEN,
            )?,
            last_name: required_text(
                "last_name",
                fields.last_name.as_deref().unwrap_or_default(),
                MAX_NAME_LEN,
            )?,
            birth_date: fields
                .birth_date
                .ok_or_else(|| EngineError::validation("birth_date is required"))?,
            email: match fields.email.flatten() {
                Some(v) if !v.trim().is_empty() => Some(validate_email("email", &v)?),
                _ => None,
            },
        };
        self.check_patient(&patient)?;
        self.persist_and_apply(&Event::PatientSaved(patient.clone()), &mut [])
            .await?;
        Ok(patient)
    }

    pub async fn update_patient(
        &self,
        id: Ulid,
        fields: PatientFields,
    ) -> Result<Patient, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let current = self
            .patients
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(Entity::Patient, id))?;
        let patient = Patient {
            id,
            national_id: match fields.national_id {
                Some(v) => required_text("national_id", &v, MAX_NATIONAL_ID_LEN)?,
                None => current.national_id,
            },
            first_name: match fields.first_name {
                Some(v) => required_text("first_name", &v, MAX_NAME_LEN)?,
                None => current.first_name,
            },
            last_name: match fields.last_name {
                Some(v) => required_text("last_name", &v, MAX_NAME_LEN)?,
                None => current.last_name,
            },
            birth_date: fields.birth_date.unwrap_or(current.birth_date),
            email: match fields.email {
                Some(Some(v)) if !v.trim().is_empty() => Some(validate_email("email", &v)?),
                Some(_) => None,
                None => current.email,
            },
        };
        self.check_patient(&patient)?;
        self.persist_and_apply(&Event::PatientSaved(patient.clone()), &mut [])
            .await
            .map(|()| patient)
    }

    /// Holds every agenda so no booking for this patient can slip in while
    /// the deletion is logged. The patient's appointments go with the same
    /// event.
    pub async fn delete_patient(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.patients.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Patient, id));
        }
        let doctor_ids: Vec<Ulid> = self.agendas.iter().map(|e| *e.key()).collect();
        let mut guards = self.lock_agendas(&doctor_ids).await?;
        let mut touched: Vec<&mut Agenda> = guards.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&Event::PatientDeleted { id }, &mut touched)
            .await
    }

    fn check_patient(&self, patient: &Patient) -> Result<(), EngineError> {
        if patient.birth_date > today() {
            return Err(EngineError::validation("birth_date is in the future"));
        }
        let taken = self
            .patients
            .iter()
            .any(|p| p.id != patient.id && p.national_id == patient.national_id);
        if taken {
            return Err(EngineError::AlreadyExists(
                Entity::Patient,
                format!("national_id {}", patient.national_id),
            ));
        }
        Ok(())
    }
}
