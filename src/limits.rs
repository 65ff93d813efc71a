use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;

/// Length of a new appointment unless configured otherwise.
pub const DEFAULT_APPOINTMENT_MINUTES: u32 = 30;
pub const MAX_APPOINTMENT_MINUTES: u32 = 24 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

// Column widths carried over from the clinic's relational schema.
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_LICENSE_LEN: usize = 50;
pub const MAX_NATIONAL_ID_LEN: usize = 20;
pub const MAX_PHONE_LEN: usize = 20;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_TEXT_LEN: usize = 10_000;

pub const MAX_SPECIALTIES: usize = 1_000;
pub const MAX_SPECIALTIES_PER_DOCTOR: usize = 32;
pub const MAX_DOCTORS: usize = 10_000;
pub const MAX_PATIENTS: usize = 1_000_000;
pub const MAX_APPOINTMENTS_PER_DOCTOR: usize = 200_000;
pub const MAX_REMINDERS_PER_APPOINTMENT: usize = 16;

/// How many times an update re-resolves an appointment that moved
/// between agendas while it was waiting for the locks.
pub const MAX_RELOCK_ATTEMPTS: usize = 8;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
