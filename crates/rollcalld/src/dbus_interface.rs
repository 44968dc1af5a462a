use crate::config::Config;
use crate::engine::EngineHandle;
use crate::enrollment::EnrollmentTracker;
use crate::error::ServiceError;
use crate::recorder::AttendanceRecorder;
use crate::registry::{PersonFilter, PersonRegistry};
use crate::report::{attendance_report, ReportFilter, ReportRange};
use crate::session::{NewSessionRequest, SessionLifecycle};
use crate::unknowns::UnknownReview;
use rollcall_core::CosineMatcher;
use rollcall_store::{NewPerson, Store};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
///
/// Structured replies are JSON. Optional string arguments use `""` for
/// absent and optional numbers use `0`.
pub struct RollcallService {
    store: Store,
    registry: PersonRegistry,
    enrollment: EnrollmentTracker,
    sessions: SessionLifecycle,
    recorder: AttendanceRecorder,
    unknowns: UnknownReview,
    model_dir: PathBuf,
    match_threshold: f32,
    min_confidence: f32,
    embedding_dim: usize,
}

impl RollcallService {
    pub fn new(config: &Config, store: Store, engine: EngineHandle) -> Self {
        Self {
            registry: PersonRegistry::new(store.clone()),
            enrollment: EnrollmentTracker::new(store.clone(), engine.clone(), config.embedding_dim),
            sessions: SessionLifecycle::new(store.clone(), config.min_confidence, config.local_offset()),
            recorder: AttendanceRecorder::new(
                store.clone(),
                engine.clone(),
                Arc::new(CosineMatcher),
                config.match_threshold,
                config.unknown_dir.clone(),
            ),
            unknowns: UnknownReview::new(store.clone(), engine, config.embedding_dim, config.unknown_dir.clone()),
            store,
            model_dir: config.model_dir.clone(),
            match_threshold: config.match_threshold,
            min_confidence: config.min_confidence,
            embedding_dim: config.embedding_dim,
        }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Register a person. Enrollment starts IN_PROGRESS.
    async fn create_person(
        &self,
        person_id: &str,
        name: &str,
        department: &str,
        term: u8,
        course: &str,
    ) -> fdo::Result<String> {
        tracing::info!(person_id, "create_person requested");
        let person = self
            .registry
            .create_person(NewPerson {
                person_id: person_id.into(),
                name: name.into(),
                department: department.into(),
                term,
                course: course.into(),
            })
            .await
            .map_err(to_fdo)?;
        json(&person)
    }

    async fn list_persons(&self, department: &str, query: &str) -> fdo::Result<String> {
        let filter = PersonFilter {
            department: non_empty(department),
            query: non_empty(query),
        };
        json(&self.registry.list_persons(filter).await.map_err(to_fdo)?)
    }

    /// Remove persons and their embeddings; returns how many were removed.
    async fn delete_persons(&self, person_ids: Vec<String>) -> fdo::Result<u32> {
        tracing::info!(count = person_ids.len(), "delete_persons requested");
        self.registry.delete_persons(&person_ids).await.map_err(to_fdo)
    }

    /// Submit one enrollment image; returns the enrolled image count.
    async fn enroll(&self, person_id: &str, image: Vec<u8>) -> fdo::Result<u32> {
        tracing::info!(person_id, bytes = image.len(), "enroll requested");
        self.enrollment.register_attempt(person_id, image).await.map_err(to_fdo)
    }

    async fn finalize_enrollment(&self, person_id: &str) -> fdo::Result<String> {
        tracing::info!(person_id, "finalize_enrollment requested");
        json(&self.enrollment.finalize(person_id).await.map_err(to_fdo)?)
    }

    async fn create_session(
        &self,
        department: &str,
        term: u8,
        subject: &str,
        course: &str,
        start_time: &str,
        duration_minutes: u32,
    ) -> fdo::Result<String> {
        tracing::info!(department, subject, start_time, "create_session requested");
        let session = self
            .sessions
            .create_session(NewSessionRequest {
                department: department.into(),
                term,
                subject: subject.into(),
                course: course.into(),
                start_time: start_time.into(),
                duration_minutes,
            })
            .await
            .map_err(to_fdo)?;
        json(&session)
    }

    async fn list_sessions(&self) -> fdo::Result<String> {
        json(&self.sessions.list_sessions().await.map_err(to_fdo)?)
    }

    async fn session_summary(&self, session_id: &str) -> fdo::Result<String> {
        json(&self.sessions.session_summary(session_id).await.map_err(to_fdo)?)
    }

    /// Append a ledger row; a second call for the same pair is rejected.
    async fn mark_attendance(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f64,
    ) -> fdo::Result<String> {
        tracing::info!(session_id, person_id, confidence, "mark_attendance requested");
        let entry = self
            .sessions
            .mark_attendance(session_id, person_id, display_name, confidence as f32)
            .await
            .map_err(to_fdo)?;
        json(&entry)
    }

    /// Refresh the person's running roster entry; returns "appended" or "updated".
    async fn record_sighting(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f64,
    ) -> fdo::Result<String> {
        let update = self
            .recorder
            .record_sighting(session_id, person_id, display_name, confidence as f32)
            .await
            .map_err(to_fdo)?;
        json(&update)
    }

    /// Match every face in the image; with a session, refresh its roster.
    async fn recognize(&self, image: Vec<u8>, session_id: &str) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), session_id, "recognize requested");
        let report = self
            .recorder
            .recognize(image, non_empty(session_id).as_deref())
            .await
            .map_err(to_fdo)?;
        json(&report)
    }

    async fn list_unknowns(&self) -> fdo::Result<Vec<String>> {
        self.unknowns.list_unknowns().await.map_err(to_fdo)
    }

    async fn assign_unknown(&self, file_name: &str, person_id: &str) -> fdo::Result<u32> {
        tracing::info!(file_name, person_id, "assign_unknown requested");
        self.unknowns.assign_unknown(file_name, person_id).await.map_err(to_fdo)
    }

    async fn delete_unknown(&self, file_name: &str) -> fdo::Result<bool> {
        self.unknowns.delete_unknown(file_name).await.map_err(to_fdo)?;
        Ok(true)
    }

    /// Ledger rows in `range` (today, week, month, year).
    async fn attendance_report(&self, range: &str, department: &str, term: u8, name: &str) -> fdo::Result<String> {
        let filter = ReportFilter {
            department: non_empty(department),
            term: (term != 0).then_some(term),
            name: non_empty(name),
        };
        let rows = attendance_report(&self.store, ReportRange::parse(range), &filter)
            .await
            .map_err(to_fdo)?;
        json(&rows)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let embeddings = self
            .store
            .embedding_count()
            .await
            .map_err(|e| to_fdo(e.into()))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_dir": self.model_dir.display().to_string(),
            "embedding_dim": self.embedding_dim,
            "match_threshold": self.match_threshold,
            "min_confidence": self.min_confidence,
            "gallery_embeddings": embeddings,
        })
        .to_string())
    }
}

/// `reason: message`, as InvalidArgs for caller mistakes and Failed otherwise.
fn to_fdo(err: ServiceError) -> fdo::Error {
    let message = format!("{}: {err}", err.reason());
    match err {
        ServiceError::InvalidInput(_) => fdo::Error::InvalidArgs(message),
        ServiceError::Storage(ref e) => {
            tracing::error!(error = %e, "storage failure");
            fdo::Error::Failed(message)
        }
        _ => fdo::Error::Failed(message),
    }
}

fn json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization: {e}")))
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
