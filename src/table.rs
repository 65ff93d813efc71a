//! Relational view of the clinic records for the SQL console.
//!
//! Every table has a fixed column list. Rows are rendered as [`Cell`]s in
//! column order; writes arrive as column/literal pairs and are turned into the
//! engine's field structs through their serde derive.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as Json};
use ulid::Ulid;

use crate::limits::MINUTE_MS;
use crate::model::*;
use crate::sql::{Assignment, CompareOp, Filter, Literal, SqlError};
use crate::timestamp::{
    format_ms, parse_date, parse_datetime, parse_datetime_lenient, TimestampError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Specialties,
    Doctors,
    Patients,
    Appointments,
    Histories,
    Prescriptions,
    Reminders,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Specialties,
        Table::Doctors,
        Table::Patients,
        Table::Appointments,
        Table::Histories,
        Table::Prescriptions,
        Table::Reminders,
    ];

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Specialties => "specialties",
            Table::Doctors => "doctors",
            Table::Patients => "patients",
            Table::Appointments => "appointments",
            Table::Histories => "histories",
            Table::Prescriptions => "prescriptions",
            Table::Reminders => "reminders",
        }
    }

    pub fn columns(self) -> &'static [Column] {
        match self {
            Table::Specialties => SPECIALTY_COLUMNS,
            Table::Doctors => DOCTOR_COLUMNS,
            Table::Patients => PATIENT_COLUMNS,
            Table::Appointments => APPOINTMENT_COLUMNS,
            Table::Histories => HISTORY_COLUMNS,
            Table::Prescriptions => PRESCRIPTION_COLUMNS,
            Table::Reminders => REMINDER_COLUMNS,
        }
    }

    pub fn column_index(self, name: &str) -> Result<usize, SqlError> {
        self.columns()
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| SqlError::UnknownColumn(self.name(), name.to_string()))
    }
}

/// How a column's values are rendered, parsed and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Id,
    Text,
    /// Upper-case enum label such as a status or a channel.
    Label,
    Int,
    Bool,
    /// Date-time, rendered RFC 3339.
    Time,
    Date,
    /// Comma-separated identifiers.
    IdList,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: Kind,
    pub writable: bool,
    pub nullable: bool,
}

const fn required(name: &'static str, kind: Kind) -> Column {
    Column { name, kind, writable: true, nullable: false }
}

const fn nullable(name: &'static str, kind: Kind) -> Column {
    Column { name, kind, writable: true, nullable: true }
}

const fn derived(name: &'static str, kind: Kind) -> Column {
    Column { name, kind, writable: false, nullable: false }
}

const SPECIALTY_COLUMNS: &[Column] = &[
    required("id", Kind::Id),
    required("name", Kind::Text),
    nullable("description", Kind::Text),
];

const DOCTOR_COLUMNS: &[Column] = &[
    required("id", Kind::Id),
    required("license", Kind::Text),
    required("first_name", Kind::Text),
    required("last_name", Kind::Text),
    required("email", Kind::Text),
    nullable("phone", Kind::Text),
    required("specialties", Kind::IdList),
];

const PATIENT_COLUMNS: &[Column] = &[
    required("id", Kind::Id),
    required("national_id", Kind::Text),
    required("first_name", Kind::Text),
    required("last_name", Kind::Text),
    required("birth_date", Kind::Date),
    nullable("email", Kind::Text),
];

const APPOINTMENT_COLUMNS: &[Column] = &[
    required("id", Kind::Id),
    required("doctor_id", Kind::Id),
    required("patient_id", Kind::Id),
    required("start", Kind::Time),
    derived("end", Kind::Time),
    derived("duration_minutes", Kind::Int),
    required("status", Kind::Label),
    nullable("reason", Kind::Text),
];

const HISTORY_COLUMNS: &[Column] = &[
    required("id", Kind::Id),
    required("appointment_id", Kind::Id),
    required("attended_on", Kind::Date),
    required("diagnosis", Kind::Text),
    nullable("treatment", Kind::Text),
];

const PRESCRIPTION_COLUMNS: &[Column] = &[
    required("id", Kind::Id),
    required("history_id", Kind::Id),
    required("issued_on", Kind::Date),
    required("medications", Kind::Text),
    nullable("instructions", Kind::Text),
];

const REMINDER_COLUMNS: &[Column] = &[
    required("id", Kind::Id),
    required("appointment_id", Kind::Id),
    required("channel", Kind::Label),
    required("send_at", Kind::Time),
    required("sent", Kind::Bool),
];

// ── Cells ────────────────────────────────────────────────────────

/// One value of a rendered row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Null,
    Text(String),
    Int(i64),
    Bool(bool),
    Time(Ms),
    Date(NaiveDate),
}

impl Cell {
    fn text(value: impl ToString) -> Cell {
        Cell::Text(value.to_string())
    }

    fn optional_text(value: &Option<String>) -> Cell {
        value.as_ref().map_or(Cell::Null, |s| Cell::Text(s.clone()))
    }

    /// Text-format rendering as sent on the wire.
    pub fn render(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Text(s) => Some(s.clone()),
            Cell::Int(n) => Some(n.to_string()),
            Cell::Bool(b) => Some(if *b { "t" } else { "f" }.to_string()),
            Cell::Time(ms) => Some(format_ms(*ms)),
            Cell::Date(d) => Some(d.to_string()),
        }
    }

    /// SQL comparison: anything against NULL is unknown.
    fn compare(&self, other: &Cell) -> Option<Ordering> {
        match (self, other) {
            (Cell::Text(a), Cell::Text(b)) => Some(a.cmp(b)),
            (Cell::Int(a), Cell::Int(b)) => Some(a.cmp(b)),
            (Cell::Bool(a), Cell::Bool(b)) => Some(a.cmp(b)),
            (Cell::Time(a), Cell::Time(b)) => Some(a.cmp(b)),
            (Cell::Date(a), Cell::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// A record that can be shown as a row of its table.
pub trait Tabular {
    const TABLE: Table;

    fn cells(&self) -> Vec<Cell>;
}

impl Tabular for Specialty {
    const TABLE: Table = Table::Specialties;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.id),
            Cell::Text(self.name.clone()),
            Cell::optional_text(&self.description),
        ]
    }
}

impl Tabular for Doctor {
    const TABLE: Table = Table::Doctors;

    fn cells(&self) -> Vec<Cell> {
        let specialties: Vec<String> = self.specialties.iter().map(Ulid::to_string).collect();
        vec![
            Cell::text(self.id),
            Cell::Text(self.license.clone()),
            Cell::Text(self.first_name.clone()),
            Cell::Text(self.last_name.clone()),
            Cell::Text(self.email.clone()),
            Cell::optional_text(&self.phone),
            Cell::Text(specialties.join(",")),
        ]
    }
}

impl Tabular for Patient {
    const TABLE: Table = Table::Patients;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.id),
            Cell::Text(self.national_id.clone()),
            Cell::Text(self.first_name.clone()),
            Cell::Text(self.last_name.clone()),
            Cell::Date(self.birth_date),
            Cell::optional_text(&self.email),
        ]
    }
}

impl Tabular for Appointment {
    const TABLE: Table = Table::Appointments;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.id),
            Cell::text(self.doctor_id),
            Cell::text(self.patient_id),
            Cell::Time(self.start),
            Cell::Time(self.end()),
            Cell::Int(self.duration / MINUTE_MS),
            Cell::text(self.status),
            Cell::optional_text(&self.reason),
        ]
    }
}

impl Tabular for ClinicalHistory {
    const TABLE: Table = Table::Histories;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.id),
            Cell::text(self.appointment_id),
            Cell::Date(self.attended_on),
            Cell::Text(self.diagnosis.clone()),
            Cell::optional_text(&self.treatment),
        ]
    }
}

impl Tabular for Prescription {
    const TABLE: Table = Table::Prescriptions;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.id),
            Cell::text(self.history_id),
            Cell::Date(self.issued_on),
            Cell::Text(self.medications.clone()),
            Cell::optional_text(&self.instructions),
        ]
    }
}

impl Tabular for Reminder {
    const TABLE: Table = Table::Reminders;

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.id),
            Cell::text(self.appointment_id),
            Cell::text(self.channel.as_str()),
            Cell::Time(self.send_at),
            Cell::Bool(self.sent),
        ]
    }
}

// ── Writes ───────────────────────────────────────────────────────

/// Build an engine field struct from `SET` / `VALUES` assignments.
pub fn decode_fields<T: DeserializeOwned>(assignments: &[Assignment]) -> Result<T, SqlError> {
    let mut object = Map::new();
    for assignment in assignments {
        let column = assignment.column;
        if object.contains_key(column.name) {
            return Err(SqlError::Unsupported(format!(
                "column {} assigned more than once",
                column.name
            )));
        }
        object.insert(column.name.to_string(), literal_to_json(column, &assignment.value)?);
    }
    serde_json::from_value(Json::Object(object)).map_err(|e| SqlError::BadLiteral(e.to_string()))
}

fn literal_to_json(column: &Column, literal: &Literal) -> Result<Json, SqlError> {
    if !column.writable {
        return Err(SqlError::ReadOnly(column.name));
    }
    if let Literal::Null = literal {
        return if column.nullable {
            Ok(Json::Null)
        } else {
            Err(SqlError::NotNull(column.name))
        };
    }
    let bad = || SqlError::BadLiteral(format!("{literal} is not a valid value for {}", column.name));

    match (column.kind, literal) {
        (Kind::Id, Literal::Text(s)) => {
            let id = Ulid::from_string(s.trim()).map_err(|_| bad())?;
            Ok(Json::String(id.to_string()))
        }
        (Kind::Text, Literal::Text(s)) => Ok(Json::String(s.clone())),
        (Kind::Text, Literal::Int(n)) => Ok(Json::String(n.to_string())),
        (Kind::Label, Literal::Text(s)) => Ok(Json::String(s.trim().to_ascii_uppercase())),
        (Kind::Bool, Literal::Bool(b)) => Ok(Json::Bool(*b)),
        (Kind::Bool, Literal::Text(s)) => parse_bool(s).map(Json::Bool).ok_or_else(bad),
        (Kind::Time, Literal::Int(ms)) => Ok(Json::from(*ms)),
        (Kind::Time, Literal::Text(s)) => parse_datetime(s).map(Json::from).map_err(|e| match e {
            TimestampError::DateOnly(_) => SqlError::InvalidValue(column.name, e.to_string()),
            TimestampError::Invalid(_) => SqlError::BadLiteral(e.to_string()),
        }),
        (Kind::Date, Literal::Text(s)) => {
            let date = parse_date(s).map_err(|e| SqlError::BadLiteral(e.to_string()))?;
            Ok(Json::String(date.to_string()))
        }
        (Kind::IdList, Literal::Text(s)) => {
            let ids = s
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Ulid::from_string(part).map(|id| Json::String(id.to_string())))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| bad())?;
            Ok(Json::Array(ids))
        }
        _ => Err(bad()),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "1" => Some(true),
        "false" | "f" | "no" | "0" => Some(false),
        _ => None,
    }
}

// ── Reads ────────────────────────────────────────────────────────

/// A `WHERE` conjunct resolved against its column's kind.
#[derive(Debug)]
pub struct Predicate {
    column: usize,
    op: CompareOp,
    value: Cell,
}

pub fn compile_filters(table: Table, filters: &[Filter]) -> Result<Vec<Predicate>, SqlError> {
    filters
        .iter()
        .map(|filter| {
            let column = &table.columns()[filter.column];
            let value = match filter.op {
                CompareOp::Like { .. } | CompareOp::IsNull | CompareOp::IsNotNull => {
                    match &filter.value {
                        Literal::Text(s) => Cell::Text(s.clone()),
                        Literal::Null => Cell::Null,
                        other => Cell::Text(other.to_string()),
                    }
                }
                _ => comparable(column, &filter.value)?,
            };
            Ok(Predicate { column: filter.column, op: filter.op, value })
        })
        .collect()
}

/// Convert a literal to the cell type the column renders.
fn comparable(column: &Column, literal: &Literal) -> Result<Cell, SqlError> {
    let bad = || SqlError::BadLiteral(format!("{literal} cannot be compared with {}", column.name));
    Ok(match (column.kind, literal) {
        (_, Literal::Null) => Cell::Null,
        (Kind::Id | Kind::Text | Kind::IdList, Literal::Text(s)) => Cell::Text(s.clone()),
        (Kind::Text, Literal::Int(n)) => Cell::Text(n.to_string()),
        (Kind::Label, Literal::Text(s)) => Cell::Text(s.trim().to_ascii_uppercase()),
        (Kind::Int, Literal::Int(n)) => Cell::Int(*n),
        (Kind::Int, Literal::Text(s)) => Cell::Int(s.trim().parse().map_err(|_| bad())?),
        (Kind::Bool, Literal::Bool(b)) => Cell::Bool(*b),
        (Kind::Bool, Literal::Text(s)) => Cell::Bool(parse_bool(s).ok_or_else(bad)?),
        (Kind::Time, Literal::Int(ms)) => Cell::Time(*ms),
        (Kind::Time, Literal::Text(s)) => {
            Cell::Time(parse_datetime_lenient(s).map_err(|e| SqlError::BadLiteral(e.to_string()))?)
        }
        (Kind::Date, Literal::Text(s)) => {
            Cell::Date(parse_date(s).map_err(|e| SqlError::BadLiteral(e.to_string()))?)
        }
        _ => return Err(bad()),
    })
}

impl Predicate {
    pub fn matches(&self, row: &[Cell]) -> bool {
        let Some(cell) = row.get(self.column) else {
            return false;
        };
        match self.op {
            CompareOp::IsNull => *cell == Cell::Null,
            CompareOp::IsNotNull => *cell != Cell::Null,
            CompareOp::Like { case_insensitive, negated } => {
                let (Some(text), Cell::Text(pattern)) = (cell.render(), &self.value) else {
                    return false;
                };
                like(pattern, &text, case_insensitive) != negated
            }
            op => match cell.compare(&self.value) {
                Some(ordering) => op.accepts(ordering),
                None => false,
            },
        }
    }
}

/// SQL `LIKE`: `%` matches any run, `_` one character, `\` escapes.
pub fn like(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.chars().flat_map(char::to_lowercase).collect()
        } else {
            s.chars().collect()
        }
    };
    let pattern = fold(pattern);
    let text = fold(text);

    let (mut p, mut t) = (0, 0);
    // Where the last `%` was seen, and the text position it is trying.
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some('_') => {
                p += 1;
                t += 1;
                continue;
            }
            Some('\\') if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                p += 2;
                t += 1;
                continue;
            }
            Some(c) if *c != '\\' && *c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, from)) => {
                p = star + 1;
                t = from + 1;
                backtrack = Some((star, from + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
