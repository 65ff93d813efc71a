//! REST surface for appointments.
//!
//! The clinic is chosen per request by the `x-clinic` header. Bodies and
//! responses are JSON; instants are RFC 3339 in UTC.

use std::sync::Arc;
use std::time::Instant;

use axum::async_trait;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, Request};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use crate::engine::{AppointmentFilter, Appointments, Engine, EngineError, Entity, Repository};
use crate::limits::MINUTE_MS;
use crate::model::{Appointment, AppointmentCandidate, AppointmentFields, AppointmentStatus, Ms};
use crate::observability::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};
use crate::tenant::TenantManager;
use crate::timestamp::Timestamp;

pub const CLINIC_HEADER: &str = "x-clinic";
const DEFAULT_CLINIC: &str = "default";

pub fn router(tenants: Arc<TenantManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/appointments", post(create_appointment).get(list_appointments))
        .route(
            "/appointments/:id",
            get(get_appointment)
                .put(replace_appointment)
                .patch(patch_appointment)
                .delete(delete_appointment),
        )
        .layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(tenants)
}

/// The engine of the clinic named by the request.
pub struct Clinic(Arc<Engine>);

#[async_trait]
impl FromRequestParts<Arc<TenantManager>> for Clinic {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        tenants: &Arc<TenantManager>,
    ) -> Result<Self, Self::Rejection> {
        let name = match parts.headers.get(CLINIC_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|_| ApiError::BadClinic("header is not valid text".into()))?,
            None => DEFAULT_CLINIC,
        };
        tenants
            .get_or_create(name)
            .map(Clinic)
            .map_err(|e| ApiError::BadClinic(e.to_string()))
    }
}

/// How an appointment is shown over HTTP.
#[derive(Debug, Serialize)]
pub struct AppointmentView {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub start: Timestamp,
    pub end: Timestamp,
    pub duration_minutes: Ms,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
}

impl From<Appointment> for AppointmentView {
    fn from(a: Appointment) -> Self {
        AppointmentView {
            id: a.id,
            doctor_id: a.doctor_id,
            patient_id: a.patient_id,
            start: Timestamp(a.start),
            end: Timestamp(a.end()),
            duration_minutes: a.duration / MINUTE_MS,
            status: a.status,
            reason: a.reason,
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_appointment(
    Clinic(engine): Clinic,
    body: Result<Json<AppointmentFields>, JsonRejection>,
) -> Result<(StatusCode, Json<AppointmentView>), ApiError> {
    let Json(fields) = body?;
    let created = engine
        .validate_and_save(AppointmentCandidate::booking(fields))
        .await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

async fn list_appointments(
    Clinic(engine): Clinic,
    filter: Result<Query<AppointmentFilter>, QueryRejection>,
) -> Result<Json<Vec<AppointmentView>>, ApiError> {
    let Query(filter) = filter?;
    let found = engine.list_appointments(&filter).await;
    Ok(Json(found.into_iter().map(Into::into).collect()))
}

async fn get_appointment(
    Clinic(engine): Clinic,
    Path(id): Path<Ulid>,
) -> Result<Json<AppointmentView>, ApiError> {
    Appointments(&engine)
        .get(id)
        .await
        .map(|a| Json(a.into()))
        .ok_or(ApiError::Engine(EngineError::NotFound(Entity::Appointment, id)))
}

/// Full replacement: the booking's doctor, patient and start must all be
/// given. A missing status keeps the stored one.
async fn replace_appointment(
    Clinic(engine): Clinic,
    Path(id): Path<Ulid>,
    body: Result<Json<AppointmentFields>, JsonRejection>,
) -> Result<Json<AppointmentView>, ApiError> {
    let Json(fields) = body?;
    for (name, present) in [
        ("doctor_id", fields.doctor_id.is_some()),
        ("patient_id", fields.patient_id.is_some()),
        ("start", fields.start.is_some()),
    ] {
        if !present {
            return Err(EngineError::validation(format!("{name} is required")).into());
        }
    }
    let updated = engine
        .validate_and_save(AppointmentCandidate::rewrite(id, fields))
        .await?;
    Ok(Json(updated.into()))
}

async fn patch_appointment(
    Clinic(engine): Clinic,
    Path(id): Path<Ulid>,
    body: Result<Json<AppointmentFields>, JsonRejection>,
) -> Result<Json<AppointmentView>, ApiError> {
    let Json(fields) = body?;
    let updated = engine
        .validate_and_save(AppointmentCandidate::rewrite(id, fields))
        .await?;
    Ok(Json(updated.into()))
}

async fn delete_appointment(
    Clinic(engine): Clinic,
    Path(id): Path<Ulid>,
) -> Result<StatusCode, ApiError> {
    Appointments(&engine).delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method)
        .record(started.elapsed().as_secs_f64());
    response
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    /// Well-formed JSON whose fields do not fit (bad id, bare date, unknown
    /// status). Reported like any other validation failure.
    InvalidField(String),
    /// The body is not JSON at all.
    Undecodable(String),
    NotJson(String),
    BadQuery(String),
    BadClinic(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(e) => ApiError::InvalidField(e.body_text()),
            JsonRejection::MissingJsonContentType(e) => ApiError::NotJson(e.body_text()),
            other => ApiError::Undecodable(other.body_text()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadQuery(rejection.body_text())
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::Overlap { .. } => (StatusCode::CONFLICT, "overlap"),
                EngineError::AlreadyExists(..) => (StatusCode::CONFLICT, "already_exists"),
                EngineError::NotFound(..) => (StatusCode::NOT_FOUND, "not_found"),
                EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
                EngineError::LimitExceeded(_) => (StatusCode::BAD_REQUEST, "limit_exceeded"),
                EngineError::WalError(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            },
            ApiError::InvalidField(_) => (StatusCode::BAD_REQUEST, "validation"),
            ApiError::Undecodable(_) => (StatusCode::UNPROCESSABLE_ENTITY, "undecodable"),
            ApiError::NotJson(_) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, "content_type"),
            ApiError::BadQuery(_) => (StatusCode::BAD_REQUEST, "validation"),
            ApiError::BadClinic(_) => (StatusCode::BAD_REQUEST, "clinic"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let message = match &self {
            ApiError::Engine(e) => e.to_string(),
            ApiError::InvalidField(m)
            | ApiError::Undecodable(m)
            | ApiError::NotJson(m)
            | ApiError::BadQuery(m)
            | ApiError::BadClinic(m) => m.clone(),
        };
        let mut body = json!({ "error": code, "message": message });
        if let ApiError::Engine(EngineError::Overlap { conflicting, .. }) = &self {
            body["conflicting_id"] = json!(conflicting);
        }
        if status.is_server_error() {
            tracing::error!(%message, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method};
    use chrono::NaiveDate;
    use serde_json::Value;
    use std::path::PathBuf;
    use tower::ServiceExt;

    use crate::engine::{Doctors, Patients};
    use crate::model::{DoctorFields, PatientFields};

    const SLOT: Ms = 30 * MINUTE_MS;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("clinic_test_http").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Fixture {
        app: Router,
        tenants: Arc<TenantManager>,
        doctor: Ulid,
        patient: Ulid,
    }

    async fn fixture(name: &str) -> Fixture {
        let tenants = Arc::new(TenantManager::new(test_data_dir(name), 1000, SLOT));
        let engine = tenants.get_or_create(DEFAULT_CLINIC).unwrap();
        let doctor = Doctors(&engine)
            .create(DoctorFields {
                license: Some("MP-7".into()),
                first_name: Some("Ana".into()),
                last_name: Some("Gómez".into()),
                email: Some("ana@clinic.example".into()),
                ..Default::default()
            })
            .await
            .unwrap()
            .id;
        let patient = Patients(&engine)
            .create(PatientFields {
                national_id: Some("30111222".into()),
                first_name: Some("Luis".into()),
                last_name: Some("Pérez".into()),
                birth_date: NaiveDate::from_ymd_opt(1990, 5, 17),
                ..Default::default()
            })
            .await
            .unwrap()
            .id;
        Fixture {
            app: router(tenants.clone()),
            tenants,
            doctor,
            patient,
        }
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn booking(f: &Fixture, start: &str) -> Value {
        json!({ "doctor_id": f.doctor, "patient_id": f.patient, "start": start })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let f = fixture("health").await;
        let (status, body) = send(&f.app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn booking_scenario_over_http() {
        let f = fixture("scenario").await;

        let (status, first) =
            send(&f.app, Method::POST, "/appointments", Some(booking(&f, "2026-10-16T10:00:00Z"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["status"], "PENDING");
        assert_eq!(first["end"], "2026-10-16T10:30:00Z");
        assert_eq!(first["duration_minutes"], 30);

        let (status, err) =
            send(&f.app, Method::POST, "/appointments", Some(booking(&f, "2026-10-16T10:15:00Z"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "overlap");
        assert_eq!(err["conflicting_id"], first["id"]);
        let message = err["message"].as_str().unwrap();
        assert!(message.contains("2026-10-16T10:00:00Z"), "{message}");
        assert!(message.contains("2026-10-16T10:30:00Z"), "{message}");

        let (status, _) =
            send(&f.app, Method::POST, "/appointments", Some(booking(&f, "2026-10-16T10:30:00Z"))).await;
        assert_eq!(status, StatusCode::CREATED);

        let uri = format!("/appointments/{}", first["id"].as_str().unwrap());
        let (status, cancelled) =
            send(&f.app, Method::PATCH, &uri, Some(json!({ "status": "CANCELLED" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "CANCELLED");

        let (status, _) =
            send(&f.app, Method::POST, "/appointments", Some(booking(&f, "2026-10-16T10:00:00Z"))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn put_requires_full_booking_and_keeps_status() {
        let f = fixture("put").await;
        let (_, created) = send(
            &f.app,
            Method::POST,
            "/appointments",
            Some(json!({
                "doctor_id": f.doctor,
                "patient_id": f.patient,
                "start": "2026-10-16T10:00:00Z",
                "status": "CONFIRMED",
            })),
        )
        .await;
        let uri = format!("/appointments/{}", created["id"].as_str().unwrap());

        let (status, err) =
            send(&f.app, Method::PUT, &uri, Some(json!({ "start": "2026-10-16T11:00:00Z" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "validation");

        let (status, moved) =
            send(&f.app, Method::PUT, &uri, Some(booking(&f, "2026-10-16T11:00:00Z"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["start"], "2026-10-16T11:00:00Z");
        assert_eq!(moved["status"], "CONFIRMED");
    }

    #[tokio::test]
    async fn put_into_taken_slot_is_refused_and_leaves_booking() {
        let f = fixture("put_conflict").await;
        let (_, taken) =
            send(&f.app, Method::POST, "/appointments", Some(booking(&f, "2026-10-16T10:00:00Z"))).await;
        let (_, mine) =
            send(&f.app, Method::POST, "/appointments", Some(booking(&f, "2026-10-16T12:00:00Z"))).await;
        let uri = format!("/appointments/{}", mine["id"].as_str().unwrap());

        let (status, err) =
            send(&f.app, Method::PUT, &uri, Some(booking(&f, "2026-10-16T10:20:00Z"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["conflicting_id"], taken["id"]);

        let (status, unchanged) = send(&f.app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(unchanged["start"], "2026-10-16T12:00:00Z");

        // Its own window never blocks it.
        let (status, shifted) =
            send(&f.app, Method::PUT, &uri, Some(booking(&f, "2026-10-16T12:10:00Z"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shifted["start"], "2026-10-16T12:10:00Z");
    }

    #[tokio::test]
    async fn error_statuses() {
        let f = fixture("errors").await;

        let missing = format!("/appointments/{}", Ulid::new());
        let (status, body) = send(&f.app, Method::GET, &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        let (status, _) = send(&f.app, Method::DELETE, &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // A bare date is not an instant.
        let (status, body) =
            send(&f.app, Method::POST, "/appointments", Some(booking(&f, "2026-10-16"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");

        // No start at all.
        let (status, _) = send(
            &f.app,
            Method::POST,
            "/appointments",
            Some(json!({ "doctor_id": f.doctor, "patient_id": f.patient })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/appointments")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = f.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/appointments")
            .body(Body::from(booking(&f, "2026-10-16T10:00:00Z").to_string()))
            .unwrap();
        let response = f.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn list_filters_and_delete() {
        let f = fixture("list").await;
        for start in ["2026-10-16T12:00:00Z", "2026-10-16T09:00:00Z"] {
            let (status, _) = send(&f.app, Method::POST, "/appointments", Some(booking(&f, start))).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let uri = format!("/appointments?doctor_id={}", f.doctor);
        let (status, list) = send(&f.app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let starts: Vec<&str> = list
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["start"].as_str().unwrap())
            .collect();
        assert_eq!(starts, vec!["2026-10-16T09:00:00Z", "2026-10-16T12:00:00Z"]);

        let (_, none) = send(&f.app, Method::GET, "/appointments?status=CANCELLED", None).await;
        assert_eq!(none.as_array().unwrap().len(), 0);

        let (status, _) = send(&f.app, Method::GET, "/appointments?status=LATE", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let first = format!("/appointments/{}", list[0]["id"].as_str().unwrap());
        let (status, _) = send(&f.app, Method::DELETE, &first, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&f.app, Method::GET, &first, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn clinic_header_selects_tenant() {
        let f = fixture("header").await;
        let (status, _) =
            send(&f.app, Method::POST, "/appointments", Some(booking(&f, "2026-10-16T10:00:00Z"))).await;
        assert_eq!(status, StatusCode::CREATED);

        // The doctor only exists in the default clinic.
        let request = axum::http::Request::builder()
            .method(Method::GET)
            .uri("/appointments")
            .header(CLINIC_HEADER, "annex")
            .body(Body::empty())
            .unwrap();
        let response = f.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"[]");
        assert_eq!(f.tenants.len(), 2);

        let request = axum::http::Request::builder()
            .uri("/appointments")
            .header(CLINIC_HEADER, "../..")
            .body(Body::empty())
            .unwrap();
        let response = f.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
