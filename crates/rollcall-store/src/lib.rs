//! rollcall-store: SQLite persistence for persons, embeddings, sessions and attendance.
//!
//! All statements run on a single `tokio-rusqlite` connection thread, so each
//! store call is atomic with respect to every other call. Uniqueness rules
//! (identity key, session key, one ledger row per session and person) live in
//! the schema rather than in read-then-write checks.

pub mod model;

pub use model::{
    AttendanceEntry, AttendanceLogEntry, EmbeddingRecord, EnrollmentStatus, NewPerson, Person,
    RosterUpdate, Session,
};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rollcall_core::{Embedding, GalleryEntry};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<tokio_rusqlite::Error> for StorageError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => Self::Sqlite(e),
            other => Self::Connection(other.to_string()),
        }
    }
}

/// A stored value that does not parse into its domain type.
#[derive(Debug, Error)]
#[error("invalid {field} value {value:?}")]
struct InvalidValue {
    field: &'static str,
    value: String,
}

type Result<T> = std::result::Result<T, StorageError>;

#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Connection(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(&path).await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let found: i64 = self
            .conn
            .call(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
            .await?;
        if found > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found,
                supported: SCHEMA_VERSION,
            });
        }

        self.conn
            .call(move |conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                if found < 1 {
                    conn.execute_batch(include_str!("../migrations/0001_initial.sql"))?;
                    conn.execute_batch("PRAGMA user_version = 1;")?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    // --- persons ---

    /// Insert a new person. Returns `false` if the identity key is taken.
    pub async fn insert_person(&self, person: NewPerson, now: DateTime<Utc>) -> Result<bool> {
        let changes = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO persons (
                        person_id, name, department, term, course, enrollment_status, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        person.person_id,
                        person.name,
                        person.department,
                        person.term,
                        person.course,
                        EnrollmentStatus::InProgress.as_str(),
                        fmt_ts(&now),
                    ],
                )?)
            })
            .await?;
        Ok(changes > 0)
    }

    pub async fn person(&self, person_id: &str) -> Result<Option<Person>> {
        let person_id = person_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE person_id = ?1"),
                        [&person_id],
                        person_from_row,
                    )
                    .optional()?)
            })
            .await?)
    }

    /// Persons ordered by identity key, optionally narrowed by department and
    /// a case-insensitive substring of name or identity key.
    pub async fn list_persons(&self, department: Option<String>, query: Option<String>) -> Result<Vec<Person>> {
        let pattern = query.map(|q| format!("%{}%", q.to_lowercase()));
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PERSON_COLUMNS} FROM persons
                     WHERE (?1 IS NULL OR department = ?1)
                       AND (?2 IS NULL OR lower(name) LIKE ?2 OR lower(person_id) LIKE ?2)
                     ORDER BY person_id"
                ))?;
                let rows = stmt.query_map(params![department, pattern], person_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }

    /// Bump the failure counter. Returns the new count, or `None` if the person is gone.
    pub async fn record_enroll_failure(&self, person_id: &str) -> Result<Option<u32>> {
        let person_id = person_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE persons SET enroll_failures = enroll_failures + 1 WHERE person_id = ?1",
                    [&person_id],
                )?;
                let count = if changed == 0 {
                    None
                } else {
                    Some(tx.query_row(
                        "SELECT enroll_failures FROM persons WHERE person_id = ?1",
                        [&person_id],
                        |row| row.get::<_, u32>(0),
                    )?)
                };
                tx.commit()?;
                Ok(count)
            })
            .await?)
    }

    /// Store a vector for the person and bump `enrolled_images`.
    /// Returns the new image count, or `None` if the person is gone.
    pub async fn add_embedding(&self, person_id: &str, embedding: &Embedding, now: DateTime<Utc>) -> Result<Option<u32>> {
        let person_id = person_id.to_string();
        let dim = embedding.dim() as i64;
        let blob = embedding.to_le_bytes();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE persons SET enrolled_images = enrolled_images + 1 WHERE person_id = ?1",
                    [&person_id],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                tx.execute(
                    "INSERT INTO embeddings (person_id, dim, vector, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![person_id, dim, blob, fmt_ts(&now)],
                )?;
                let count = tx.query_row(
                    "SELECT enrolled_images FROM persons WHERE person_id = ?1",
                    [&person_id],
                    |row| row.get::<_, u32>(0),
                )?;
                tx.commit()?;
                Ok(Some(count))
            })
            .await?)
    }

    pub async fn set_enrollment_status(&self, person_id: &str, status: EnrollmentStatus) -> Result<bool> {
        let person_id = person_id.to_string();
        let changes = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE persons SET enrollment_status = ?2 WHERE person_id = ?1",
                    params![person_id, status.as_str()],
                )?)
            })
            .await?;
        Ok(changes > 0)
    }

    /// Delete the person and every embedding it owns. Returns `false` if absent.
    pub async fn delete_person(&self, person_id: &str) -> Result<bool> {
        let person_id = person_id.to_string();
        let changes = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM embeddings WHERE person_id = ?1", [&person_id])?;
                let changes = tx.execute("DELETE FROM persons WHERE person_id = ?1", [&person_id])?;
                tx.commit()?;
                Ok(changes)
            })
            .await?;
        Ok(changes > 0)
    }

    // --- embeddings ---

    pub async fn embeddings_for(&self, person_id: &str) -> Result<Vec<EmbeddingRecord>> {
        let person_id = person_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, person_id, vector, created_at FROM embeddings
                     WHERE person_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map([&person_id], |row| {
                    Ok(EmbeddingRecord {
                        id: row.get(0)?,
                        person_id: row.get(1)?,
                        embedding: vector_col(row, 2)?,
                        created_at: ts_col(row, 3)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }

    pub async fn embedding_count(&self) -> Result<u64> {
        Ok(self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?))
            .await?)
    }

    /// Every stored vector with its owner's display name, in insertion order.
    pub async fn gallery(&self) -> Result<Vec<GalleryEntry>> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT e.person_id, p.name, e.vector FROM embeddings e
                     JOIN persons p ON p.person_id = e.person_id
                     ORDER BY e.id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(GalleryEntry {
                        person_id: row.get(0)?,
                        display_name: row.get(1)?,
                        embedding: vector_col(row, 2)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }

    // --- sessions ---

    /// Insert a session. Returns `false` if its (department, term, subject,
    /// start time) key is already taken.
    pub async fn insert_session(&self, session: &Session) -> Result<bool> {
        let s = session.clone();
        let changes = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO sessions (
                        session_id, department, term, subject, course,
                        start_time, end_time, duration_minutes, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        s.session_id,
                        s.department,
                        s.term,
                        s.subject,
                        s.course,
                        fmt_ts(&s.start_time),
                        fmt_ts(&s.end_time),
                        s.duration_minutes,
                        fmt_ts(&s.created_at),
                    ],
                )?)
            })
            .await?;
        Ok(changes > 0)
    }

    pub async fn session_key_exists(
        &self,
        department: &str,
        term: u8,
        subject: &str,
        start_time: DateTime<Utc>,
    ) -> Result<bool> {
        let (department, subject) = (department.to_string(), subject.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM sessions
                         WHERE department = ?1 AND term = ?2 AND subject = ?3 AND start_time = ?4",
                        params![department, term, subject, fmt_ts(&start_time)],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some())
            })
            .await?)
    }

    /// Load a session with its running roster.
    pub async fn session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let session = conn
                    .query_row(
                        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                        [&session_id],
                        session_from_row,
                    )
                    .optional()?;
                match session {
                    Some(mut s) => {
                        s.attendances = load_roster(conn, &s.session_id)?;
                        Ok(Some(s))
                    }
                    None => Ok(None),
                }
            })
            .await?)
    }

    /// Sessions whose end time is at or after `cutoff`, by start time.
    pub async fn sessions_ending_after(&self, cutoff: DateTime<Utc>) -> Result<Vec<Session>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE end_time >= ?1 ORDER BY start_time, session_id"
                ))?;
                let mut sessions = stmt
                    .query_map([fmt_ts(&cutoff)], session_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for s in &mut sessions {
                    s.attendances = load_roster(conn, &s.session_id)?;
                }
                Ok(sessions)
            })
            .await?)
    }

    /// Refresh the person's running record in the session, appending one if absent.
    pub async fn upsert_roster_entry(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f32,
        now: DateTime<Utc>,
    ) -> Result<RosterUpdate> {
        let (session_id, person_id, display_name) =
            (session_id.to_string(), person_id.to_string(), display_name.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = fmt_ts(&now);
                let updated = tx.execute(
                    "UPDATE session_roster SET last_seen = ?3, confidence = ?4, marked_at = ?3
                     WHERE session_id = ?1 AND person_id = ?2",
                    params![session_id, person_id, now, confidence],
                )?;
                let outcome = if updated > 0 {
                    RosterUpdate::Updated
                } else {
                    tx.execute(
                        "INSERT INTO session_roster (
                            session_id, person_id, display_name, first_seen, last_seen, confidence, marked_at
                        ) VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?4)",
                        params![session_id, person_id, display_name, now, confidence],
                    )?;
                    RosterUpdate::Appended
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?)
    }

    // --- attendance ledger ---

    /// Insert a ledger row. Returns `false` if the (session, person) pair is
    /// already recorded; the existing row is left untouched.
    pub async fn insert_attendance_log(&self, entry: &AttendanceLogEntry) -> Result<bool> {
        let e = entry.clone();
        let changes = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO attendance_log (
                        session_id, person_id, display_name, date, in_time, out_time, confidence
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        e.session_id,
                        e.person_id,
                        e.display_name,
                        e.date.to_string(),
                        fmt_ts(&e.in_time),
                        e.out_time.as_ref().map(fmt_ts),
                        e.confidence,
                    ],
                )?)
            })
            .await?;
        Ok(changes > 0)
    }

    pub async fn attendance_log_exists(&self, session_id: &str, person_id: &str) -> Result<bool> {
        let (session_id, person_id) = (session_id.to_string(), person_id.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM attendance_log WHERE session_id = ?1 AND person_id = ?2",
                        [&session_id, &person_id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some())
            })
            .await?)
    }

    pub async fn attendance_log_for_session(&self, session_id: &str) -> Result<Vec<AttendanceLogEntry>> {
        let session_id = session_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LOG_COLUMNS} FROM attendance_log WHERE session_id = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map([&session_id], log_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }

    /// Ledger rows dated within `[start, end]`, oldest first.
    pub async fn attendance_log_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<AttendanceLogEntry>> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LOG_COLUMNS} FROM attendance_log
                     WHERE date >= ?1 AND date <= ?2 ORDER BY date, in_time, id"
                ))?;
                let rows = stmt.query_map([start.to_string(), end.to_string()], log_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }
}

const PERSON_COLUMNS: &str = "person_id, name, department, term, course, enroll_failures, \
                              enrolled_images, enrollment_status, created_at";

const SESSION_COLUMNS: &str = "session_id, department, term, subject, course, start_time, \
                               end_time, duration_minutes, created_at";

const LOG_COLUMNS: &str = "session_id, person_id, display_name, date, in_time, out_time, confidence";

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    let status: String = row.get(7)?;
    let enrollment_status = EnrollmentStatus::parse(&status).ok_or_else(|| invalid(7, "enrollment_status", status))?;
    Ok(Person {
        person_id: row.get(0)?,
        name: row.get(1)?,
        department: row.get(2)?,
        term: row.get(3)?,
        course: row.get(4)?,
        enroll_failures: row.get(5)?,
        enrolled_images: row.get(6)?,
        enrollment_status,
        created_at: ts_col(row, 8)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        department: row.get(1)?,
        term: row.get(2)?,
        subject: row.get(3)?,
        course: row.get(4)?,
        start_time: ts_col(row, 5)?,
        end_time: ts_col(row, 6)?,
        duration_minutes: row.get(7)?,
        created_at: ts_col(row, 8)?,
        attendances: Vec::new(),
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceLogEntry> {
    let date: String = row.get(3)?;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let out_time = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(parse_ts(5, &raw)?),
        None => None,
    };
    Ok(AttendanceLogEntry {
        session_id: row.get(0)?,
        person_id: row.get(1)?,
        display_name: row.get(2)?,
        date,
        in_time: ts_col(row, 4)?,
        out_time,
        confidence: row.get::<_, f64>(6)? as f32,
    })
}

fn load_roster(conn: &rusqlite::Connection, session_id: &str) -> rusqlite::Result<Vec<AttendanceEntry>> {
    let mut stmt = conn.prepare(
        "SELECT person_id, display_name, first_seen, last_seen, confidence, marked_at
         FROM session_roster WHERE session_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([session_id], |row| {
        Ok(AttendanceEntry {
            person_id: row.get(0)?,
            display_name: row.get(1)?,
            first_seen: ts_col(row, 2)?,
            last_seen: ts_col(row, 3)?,
            confidence: row.get::<_, f64>(4)? as f32,
            marked_at: ts_col(row, 5)?,
        })
    })?;
    rows.collect()
}

/// Fixed-width RFC 3339 so text order matches time order.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn vector_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Embedding> {
    let blob: Vec<u8> = row.get(idx)?;
    Embedding::from_le_bytes(&blob).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            Box::new(InvalidValue {
                field: "vector",
                value: format!("{} bytes", blob.len()),
            }),
        )
    })
}

fn invalid(idx: usize, field: &'static str, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(InvalidValue { field, value }))
}
