//! Session lifecycle: creation, derived status, and the attendance ledger.
//!
//! Status is never stored. It is computed from the stored UTC start and end
//! against the caller's `now`:
//!
//! | condition                      | status   |
//! |--------------------------------|----------|
//! | `now < start`                  | UPCOMING |
//! | `start <= now <= end`          | LIVE     |
//! | `end < now <= end + 12h`       | EXPIRED  |
//! | `now > end + 12h`              | not listed |

use crate::error::{required, validate_identity, validate_term, Result, ServiceError};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, SecondsFormat, Utc};
use rollcall_store::{AttendanceLogEntry, Session, Store};
use serde::Serialize;

/// How long an ended session stays visible in listings.
pub const EXPIRED_RETENTION_HOURS: i64 = 12;

pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Upcoming,
    Live,
    Expired,
}

impl SessionStatus {
    /// Phase of `session` at `now`, ignoring listing retention.
    pub fn phase_at(session: &Session, now: DateTime<Utc>) -> Self {
        if now < session.start_time {
            Self::Upcoming
        } else if now <= session.end_time {
            Self::Live
        } else {
            Self::Expired
        }
    }

    /// Listing status; `None` once the session is past its retention window.
    pub fn at(session: &Session, now: DateTime<Utc>) -> Option<Self> {
        if now > session.end_time + Duration::hours(EXPIRED_RETENTION_HOURS) {
            return None;
        }
        Some(Self::phase_at(session, now))
    }
}

/// Reject unless `session` is live at `now`.
pub fn ensure_live(session: &Session, now: DateTime<Utc>) -> Result<()> {
    match SessionStatus::phase_at(session, now) {
        SessionStatus::Upcoming => Err(ServiceError::SessionNotStarted(session.session_id.clone())),
        SessionStatus::Expired => Err(ServiceError::SessionExpired(session.session_id.clone())),
        SessionStatus::Live => Ok(()),
    }
}

/// A session together with its derived status.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub status: SessionStatus,
}

#[derive(Debug, Clone)]
pub struct NewSessionRequest {
    pub department: String,
    pub term: u8,
    pub subject: String,
    pub course: String,
    /// RFC 3339, or `YYYY-MM-DDTHH:MM[:SS]` in caller-local time.
    pub start_time: String,
    pub duration_minutes: u32,
}

/// Parse a start time. Inputs without an offset are read at `local`.
pub fn parse_start_time(raw: &str, local: FixedOffset) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            if let Some(t) = naive.and_local_timezone(local).single() {
                return Ok(t.with_timezone(&Utc));
            }
        }
    }
    Err(ServiceError::InvalidInput(format!("start_time {raw:?} is not a valid timestamp")))
}

#[derive(Clone)]
pub struct SessionLifecycle {
    store: Store,
    min_confidence: f32,
    local_offset: FixedOffset,
}

impl SessionLifecycle {
    pub fn new(store: Store, min_confidence: f32, local_offset: FixedOffset) -> Self {
        Self {
            store,
            min_confidence,
            local_offset,
        }
    }

    pub async fn create_session(&self, req: NewSessionRequest) -> Result<Session> {
        self.create_session_at(req, Utc::now()).await
    }

    pub async fn create_session_at(&self, req: NewSessionRequest, now: DateTime<Utc>) -> Result<Session> {
        let department = required("department", &req.department)?;
        let subject = required("subject", &req.subject)?;
        let course = required("course", &req.course)?;
        let term = validate_term(req.term)?;
        if !(1..=MAX_DURATION_MINUTES).contains(&req.duration_minutes) {
            return Err(ServiceError::InvalidInput(format!(
                "duration_minutes must be between 1 and {MAX_DURATION_MINUTES}, got {}",
                req.duration_minutes
            )));
        }
        let start_time = parse_start_time(&req.start_time, self.local_offset)?;
        let end_time = start_time + Duration::minutes(i64::from(req.duration_minutes));

        let duplicate = || ServiceError::DuplicateSession {
            department: department.clone(),
            term,
            subject: subject.clone(),
            start_time: start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        if self
            .store
            .session_key_exists(&department, term, &subject, start_time)
            .await?
        {
            return Err(duplicate());
        }

        let session = Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            department: department.clone(),
            term,
            subject: subject.clone(),
            course,
            start_time,
            end_time,
            duration_minutes: req.duration_minutes,
            created_at: now,
            attendances: Vec::new(),
        };
        if !self.store.insert_session(&session).await? {
            return Err(duplicate());
        }
        tracing::info!(
            session_id = %session.session_id,
            department = %session.department,
            subject = %session.subject,
            start = %session.start_time,
            end = %session.end_time,
            "session created"
        );
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionView>> {
        self.list_sessions_at(Utc::now()).await
    }

    /// Every session still within its listing window, by start time.
    pub async fn list_sessions_at(&self, now: DateTime<Utc>) -> Result<Vec<SessionView>> {
        let cutoff = now - Duration::hours(EXPIRED_RETENTION_HOURS);
        let sessions = self.store.sessions_ending_after(cutoff).await?;
        Ok(sessions
            .into_iter()
            .filter_map(|session| SessionStatus::at(&session, now).map(|status| SessionView { session, status }))
            .collect())
    }

    pub async fn session_summary(&self, session_id: &str) -> Result<SessionView> {
        self.session_summary_at(session_id, Utc::now()).await
    }

    /// The session, its phase, and its running roster in first-seen order.
    pub async fn session_summary_at(&self, session_id: &str, now: DateTime<Utc>) -> Result<SessionView> {
        let session = self.load(session_id).await?;
        let status = SessionStatus::phase_at(&session, now);
        Ok(SessionView { session, status })
    }

    pub async fn mark_attendance(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f32,
    ) -> Result<AttendanceLogEntry> {
        self.mark_attendance_at(session_id, person_id, display_name, confidence, Utc::now())
            .await
    }

    /// Append a ledger row for `person_id`. At most one row exists per
    /// (session, person); a repeat is rejected and the first row kept.
    pub async fn mark_attendance_at(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f32,
        now: DateTime<Utc>,
    ) -> Result<AttendanceLogEntry> {
        validate_identity("person", person_id)?;
        let display_name = required("display_name", display_name)?;
        let session = self.load(session_id).await?;
        ensure_live(&session, now)?;

        // NaN fails this comparison too.
        if !(confidence >= self.min_confidence) {
            return Err(ServiceError::LowConfidence {
                confidence,
                minimum: self.min_confidence,
            });
        }

        let duplicate = || ServiceError::DuplicateAttendance {
            session_id: session_id.to_string(),
            person_id: person_id.to_string(),
        };
        if self.store.attendance_log_exists(session_id, person_id).await? {
            return Err(duplicate());
        }

        let entry = AttendanceLogEntry {
            session_id: session_id.to_string(),
            person_id: person_id.to_string(),
            display_name,
            date: now.date_naive(),
            in_time: now,
            out_time: None,
            confidence,
        };
        if !self.store.insert_attendance_log(&entry).await? {
            return Err(duplicate());
        }
        tracing::info!(session_id, person_id, confidence, "attendance marked");
        Ok(entry)
    }

    async fn load(&self, session_id: &str) -> Result<Session> {
        validate_identity("session", session_id)?;
        self.store
            .session(session_id)
            .await?
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))
    }
}
