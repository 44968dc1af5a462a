//! Live recognition and the per-session running roster.
//!
//! Unlike the ledger in [`crate::session`], a roster entry is refreshed on
//! every sighting; repeated recognitions of the same person never fail.

use crate::engine::{EngineError, EngineHandle};
use crate::error::{required, validate_identity, Result, ServiceError};
use crate::session::ensure_live;
use chrono::{DateTime, Utc};
use rollcall_core::{save_face_crop, BoundingBox, Matcher, MatchResult, RgbImage};
use rollcall_store::{RosterUpdate, Session, Store};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// What happened to the running roster for one face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttendanceOutcome {
    Recorded { update: RosterUpdate },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceOutcome {
    pub bbox: BoundingBox,
    #[serde(rename = "match")]
    pub result: MatchResult,
    /// Present only when a session was named and the face was recognized.
    pub attendance: Option<AttendanceOutcome>,
    /// Thumbnail saved for review when the face was not recognized.
    pub unknown_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionReport {
    pub gallery_size: usize,
    pub faces: Vec<FaceOutcome>,
}

#[derive(Clone)]
pub struct AttendanceRecorder {
    store: Store,
    engine: EngineHandle,
    matcher: Arc<dyn Matcher + Send + Sync>,
    match_threshold: f32,
    unknown_dir: PathBuf,
}

impl AttendanceRecorder {
    pub fn new(
        store: Store,
        engine: EngineHandle,
        matcher: Arc<dyn Matcher + Send + Sync>,
        match_threshold: f32,
        unknown_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            engine,
            matcher,
            match_threshold,
            unknown_dir,
        }
    }

    pub async fn record_sighting(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f32,
    ) -> Result<RosterUpdate> {
        self.record_sighting_at(session_id, person_id, display_name, confidence, Utc::now())
            .await
    }

    /// Refresh `person_id`'s running entry in the session, appending one on
    /// first sighting. The session must be live.
    pub async fn record_sighting_at(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f32,
        now: DateTime<Utc>,
    ) -> Result<RosterUpdate> {
        validate_identity("session", session_id)?;
        validate_identity("person", person_id)?;
        let display_name = required("display_name", display_name)?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ServiceError::InvalidInput(format!(
                "confidence must be between 0 and 1, got {confidence}"
            )));
        }
        let Some(session) = self.store.session(session_id).await? else {
            return Err(ServiceError::SessionNotFound(session_id.to_string()));
        };
        ensure_live(&session, now)?;

        let update = self
            .store
            .upsert_roster_entry(session_id, person_id, &display_name, confidence, now)
            .await?;
        tracing::debug!(session_id, person_id, confidence, ?update, "sighting recorded");
        Ok(update)
    }

    pub async fn recognize(&self, image: Vec<u8>, session_id: Option<&str>) -> Result<RecognitionReport> {
        self.recognize_at(image, session_id, Utc::now()).await
    }

    /// Match every face in `image` against the current gallery. With a
    /// session named, recognized faces refresh its roster while it is live.
    pub async fn recognize_at(
        &self,
        image: Vec<u8>,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RecognitionReport> {
        if image.is_empty() {
            return Err(ServiceError::InvalidInput("image payload is empty".into()));
        }
        if let Some(id) = session_id {
            validate_identity("session", id)?;
        }

        let analysis = self.engine.analyze(image).await.map_err(|e| match e {
            EngineError::Extract(inner) if inner.is_bad_input() => ServiceError::InvalidInput(inner.to_string()),
            other => ServiceError::EngineFailure(other.to_string()),
        })?;

        let session = match session_id {
            Some(id) => Some((id, self.store.session(id).await?)),
            None => None,
        };
        let gallery = self.store.gallery().await?;

        let mut faces = Vec::with_capacity(analysis.faces.len());
        for (idx, face) in analysis.faces.iter().enumerate() {
            let result = self.matcher.compare(&face.embedding, &gallery, self.match_threshold);

            let attendance = match (&session, result.recognized) {
                (Some((id, session)), true) => Some(self.refresh_roster(id, session.as_ref(), &result, now).await),
                _ => None,
            };
            let unknown_file = if result.recognized {
                None
            } else {
                self.save_unknown(&analysis.image, &face.bbox, idx, now)
            };

            faces.push(FaceOutcome {
                bbox: face.bbox,
                result,
                attendance,
                unknown_file,
            });
        }

        tracing::info!(
            faces = faces.len(),
            recognized = faces.iter().filter(|f| f.result.recognized).count(),
            gallery_size = gallery.len(),
            session_id = session_id.unwrap_or(""),
            "recognition complete"
        );
        Ok(RecognitionReport {
            gallery_size: gallery.len(),
            faces,
        })
    }

    async fn refresh_roster(
        &self,
        session_id: &str,
        session: Option<&Session>,
        result: &MatchResult,
        now: DateTime<Utc>,
    ) -> AttendanceOutcome {
        let skipped = |reason: &str| AttendanceOutcome::Skipped {
            reason: reason.to_string(),
        };
        let Some(session) = session else {
            return skipped("session_not_found");
        };
        if let Err(e) = ensure_live(session, now) {
            return skipped(e.reason());
        }
        let (Some(person_id), Some(display_name)) = (&result.person_id, &result.display_name) else {
            return skipped("no_candidate");
        };

        match self
            .store
            .upsert_roster_entry(session_id, person_id, display_name, result.score, now)
            .await
        {
            Ok(update) => AttendanceOutcome::Recorded { update },
            Err(e) => {
                tracing::warn!(session_id, person_id = %person_id, error = %e, "roster update failed");
                skipped(ServiceError::from(e).reason())
            }
        }
    }

    /// Best-effort thumbnail for later review. Failures are logged only.
    fn save_unknown(&self, image: &RgbImage, bbox: &BoundingBox, idx: usize, now: DateTime<Utc>) -> Option<String> {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("unknown_{}_{idx}_{}.jpg", now.timestamp_millis(), &tag[..8]);
        match save_face_crop(image, bbox, &self.unknown_dir.join(&name)) {
            Ok(true) => Some(name),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "could not save unknown face");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::test_support::{at, png, seed_person, test_store, FakeExtractor, NO_FACE, POISON};
    use rollcall_core::{CosineMatcher, Embedding};

    struct Fixture {
        recorder: AttendanceRecorder,
        store: Store,
        unknown_dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let store = test_store().await;
        let unknown_dir = tempfile::tempdir().unwrap();
        let recorder = AttendanceRecorder::new(
            store.clone(),
            spawn_engine(FakeExtractor).unwrap(),
            Arc::new(CosineMatcher),
            0.55,
            unknown_dir.path().to_path_buf(),
        );
        seed_person(&store, "101", "Asha").await;
        store.add_embedding("101", &Embedding::new(vec![1.0, 2.0, 3.0]), at(8, 0)).await.unwrap();
        store
            .insert_session(&Session {
                session_id: "maths".into(),
                department: "CSE".into(),
                term: 3,
                subject: "Maths".into(),
                course: "BTech".into(),
                start_time: at(10, 0),
                end_time: at(11, 0),
                duration_minutes: 60,
                created_at: at(9, 0),
                attendances: Vec::new(),
            })
            .await
            .unwrap();
        Fixture {
            recorder,
            store,
            unknown_dir,
        }
    }

    #[tokio::test]
    async fn test_sighting_appends_then_refreshes() {
        let f = fixture().await;
        let first = f.recorder.record_sighting_at("maths", "101", "Asha", 0.7, at(10, 5)).await.unwrap();
        let again = f.recorder.record_sighting_at("maths", "101", "Asha", 0.9, at(10, 40)).await.unwrap();
        assert_eq!(first, RosterUpdate::Appended);
        assert_eq!(again, RosterUpdate::Updated);

        let s = f.store.session("maths").await.unwrap().unwrap();
        assert_eq!(s.attendances.len(), 1);
        assert_eq!(s.attendances[0].first_seen, at(10, 5));
        assert_eq!(s.attendances[0].last_seen, at(10, 40));

        let err = f.recorder.record_sighting_at("nope", "101", "Asha", 0.9, at(10, 40)).await.unwrap_err();
        assert_eq!(err.reason(), "session_not_found");
    }

    #[tokio::test]
    async fn test_sighting_outside_window_is_rejected() {
        let f = fixture().await;
        let err = f.recorder.record_sighting_at("maths", "101", "Asha", 0.9, at(9, 59)).await.unwrap_err();
        assert_eq!(err.reason(), "session_not_started");
        let err = f.recorder.record_sighting_at("maths", "101", "Asha", 0.9, at(11, 1)).await.unwrap_err();
        assert_eq!(err.reason(), "session_expired");
        let err = f.recorder.record_sighting_at("maths", "101", "Asha", 0.9, at(23, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "session_expired");
        assert!(f.store.session("maths").await.unwrap().unwrap().attendances.is_empty());
    }

    #[tokio::test]
    async fn test_sighting_rejects_malformed_input() {
        let f = fixture().await;
        for (name, confidence) in [("", 0.9), ("   ", 0.9), ("Asha", f32::NAN), ("Asha", -5.0), ("Asha", 1.5)] {
            let err = f
                .recorder
                .record_sighting_at("maths", "101", name, confidence, at(10, 30))
                .await
                .unwrap_err();
            assert_eq!(err.reason(), "invalid_input", "{name:?} {confidence}");
        }
        assert!(f.store.session("maths").await.unwrap().unwrap().attendances.is_empty());

        f.recorder.record_sighting_at("maths", "101", "  Asha ", 0.9, at(10, 30)).await.unwrap();
        let roster = f.store.session("maths").await.unwrap().unwrap().attendances;
        assert_eq!(roster[0].display_name, "Asha");
    }

    #[tokio::test]
    async fn test_recognize_live_session_refreshes_roster() {
        let f = fixture().await;
        let report = f.recorder.recognize_at(png([1, 2, 3]), Some("maths"), at(10, 10)).await.unwrap();
        assert_eq!(report.gallery_size, 1);
        assert_eq!(report.faces.len(), 1);
        let face = &report.faces[0];
        assert!(face.result.recognized);
        assert_eq!(face.result.person_id.as_deref(), Some("101"));
        assert_eq!(
            face.attendance,
            Some(AttendanceOutcome::Recorded {
                update: RosterUpdate::Appended
            })
        );
        assert!(face.unknown_file.is_none());

        let report = f.recorder.recognize_at(png([2, 4, 6]), Some("maths"), at(10, 20)).await.unwrap();
        assert_eq!(
            report.faces[0].attendance,
            Some(AttendanceOutcome::Recorded {
                update: RosterUpdate::Updated
            })
        );
        let roster = f.store.session("maths").await.unwrap().unwrap().attendances;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].last_seen, at(10, 20));
    }

    #[tokio::test]
    async fn test_recognize_outside_window_is_skipped() {
        let f = fixture().await;
        let early = f.recorder.recognize_at(png([1, 2, 3]), Some("maths"), at(9, 0)).await.unwrap();
        assert_eq!(
            early.faces[0].attendance,
            Some(AttendanceOutcome::Skipped {
                reason: "session_not_started".into()
            })
        );
        let late = f.recorder.recognize_at(png([1, 2, 3]), Some("maths"), at(11, 1)).await.unwrap();
        assert_eq!(
            late.faces[0].attendance,
            Some(AttendanceOutcome::Skipped {
                reason: "session_expired".into()
            })
        );
        let missing = f.recorder.recognize_at(png([1, 2, 3]), Some("physics"), at(10, 30)).await.unwrap();
        assert_eq!(
            missing.faces[0].attendance,
            Some(AttendanceOutcome::Skipped {
                reason: "session_not_found".into()
            })
        );
        assert!(f.store.session("maths").await.unwrap().unwrap().attendances.is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_face_saves_thumbnail() {
        let f = fixture().await;
        let report = f.recorder.recognize_at(png([200, 0, 0]), Some("maths"), at(10, 10)).await.unwrap();
        let face = &report.faces[0];
        assert!(!face.result.recognized);
        // Best guess is still reported.
        assert_eq!(face.result.person_id.as_deref(), Some("101"));
        assert!(face.attendance.is_none());

        let name = face.unknown_file.clone().unwrap();
        assert!(name.starts_with(&format!("unknown_{}_0_", at(10, 10).timestamp_millis())));
        assert!(name.ends_with(".jpg"));
        assert!(f.unknown_dir.path().join(&name).exists());
    }

    #[tokio::test]
    async fn test_same_instant_thumbnails_do_not_collide() {
        let f = fixture().await;
        let (a, b) = tokio::join!(
            f.recorder.recognize_at(png([200, 0, 0]), None, at(10, 10)),
            f.recorder.recognize_at(png([0, 200, 0]), None, at(10, 10)),
        );
        let a = a.unwrap().faces[0].unknown_file.clone().unwrap();
        let b = b.unwrap().faces[0].unknown_file.clone().unwrap();
        assert_ne!(a, b);
        assert!(f.unknown_dir.path().join(&a).exists());
        assert!(f.unknown_dir.path().join(&b).exists());
    }

    #[tokio::test]
    async fn test_recognize_without_session_or_faces() {
        let f = fixture().await;
        let report = f.recorder.recognize_at(png([1, 2, 3]), None, at(10, 10)).await.unwrap();
        assert!(report.faces[0].result.recognized);
        assert!(report.faces[0].attendance.is_none());

        let report = f.recorder.recognize_at(png(NO_FACE), Some("maths"), at(10, 10)).await.unwrap();
        assert!(report.faces.is_empty());
    }

    #[tokio::test]
    async fn test_recognize_input_and_engine_errors() {
        let f = fixture().await;
        let err = f.recorder.recognize_at(Vec::new(), None, at(10, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
        let err = f.recorder.recognize_at(b"junk".to_vec(), None, at(10, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
        let err = f.recorder.recognize_at(png(POISON), None, at(10, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "engine_failure");
    }

    #[tokio::test]
    async fn test_empty_gallery_reports_no_match() {
        let store = test_store().await;
        let dir = tempfile::tempdir().unwrap();
        let recorder = AttendanceRecorder::new(
            store,
            spawn_engine(FakeExtractor).unwrap(),
            Arc::new(CosineMatcher),
            0.55,
            dir.path().to_path_buf(),
        );
        let report = recorder.recognize_at(png([1, 2, 3]), None, at(10, 0)).await.unwrap();
        assert_eq!(report.gallery_size, 0);
        assert_eq!(report.faces[0].result, MatchResult::no_candidates());
    }
}
