use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::Embedding;
use serde::Serialize;

/// Enrollment progress of a person. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    InProgress,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// An enrolled subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Person {
    /// Roll number; unique and immutable.
    pub person_id: String,
    pub name: String,
    pub department: String,
    /// Semester, 1–10.
    pub term: u8,
    pub course: String,
    pub enroll_failures: u32,
    pub enrolled_images: u32,
    pub enrollment_status: EnrollmentStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when registering a person.
#[derive(Debug, Clone)]
pub struct NewPerson {
    pub person_id: String,
    pub name: String,
    pub department: String,
    pub term: u8,
    pub course: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub person_id: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// Running per-session record, refreshed on every sighting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub person_id: String,
    pub display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub confidence: f32,
    pub marked_at: DateTime<Utc>,
}

/// A time-boxed class meeting. Times are UTC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub department: String,
    pub term: u8,
    pub subject: String,
    pub course: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: u32,
    pub created_at: DateTime<Utc>,
    /// Running roster in first-seen order.
    pub attendances: Vec<AttendanceEntry>,
}

/// Ledger row; at most one per (session, person).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceLogEntry {
    pub session_id: String,
    pub person_id: String,
    pub display_name: String,
    pub date: NaiveDate,
    pub in_time: DateTime<Utc>,
    pub out_time: Option<DateTime<Utc>>,
    pub confidence: f32,
}

/// What a running-record write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterUpdate {
    Appended,
    Updated,
}
