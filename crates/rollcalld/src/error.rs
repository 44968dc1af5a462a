use rollcall_store::StorageError;
use thiserror::Error;

/// Every rejection the daemon reports. [`reason`](ServiceError::reason) is the
/// stable machine-readable tag; the `Display` text is for humans.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("face engine failure: {0}")]
    EngineFailure(String),
    #[error("person {0} not found")]
    PersonNotFound(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("person {0} already exists")]
    DuplicatePerson(String),
    #[error("a {subject} session for {department} term {term} already starts at {start_time}")]
    DuplicateSession {
        department: String,
        term: u8,
        subject: String,
        start_time: String,
    },
    #[error("attendance for {person_id} is already marked in session {session_id}")]
    DuplicateAttendance { session_id: String, person_id: String },
    #[error("enrollment attempt for {person_id} failed ({failures} failures so far): {cause}")]
    EnrollmentAttemptFailed {
        person_id: String,
        failures: u32,
        cause: String,
    },
    #[error("enrollment for {person_id} aborted after {failures} failures ({cause}); person removed, register again")]
    EnrollmentAborted {
        person_id: String,
        failures: u32,
        cause: String,
    },
    #[error("no images enrolled for {0}; person removed")]
    NoImagesEnrolled(String),
    #[error("session {0} has not started yet")]
    SessionNotStarted(String),
    #[error("session {0} has ended")]
    SessionExpired(String),
    #[error("confidence {confidence:.3} is below the minimum {minimum:.3}")]
    LowConfidence { confidence: f32, minimum: f32 },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl ServiceError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::EngineFailure(_) => "engine_failure",
            Self::PersonNotFound(_) => "person_not_found",
            Self::SessionNotFound(_) => "session_not_found",
            Self::NotFound(_) => "not_found",
            Self::DuplicatePerson(_) => "duplicate_person",
            Self::DuplicateSession { .. } => "duplicate_session",
            Self::DuplicateAttendance { .. } => "duplicate_attendance",
            Self::EnrollmentAttemptFailed { .. } => "enrollment_attempt_failed",
            Self::EnrollmentAborted { .. } => "enrollment_aborted",
            Self::NoImagesEnrolled(_) => "no_images_enrolled",
            Self::SessionNotStarted(_) => "session_not_started",
            Self::SessionExpired(_) => "session_expired",
            Self::LowConfidence { .. } => "low_confidence",
            Self::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Identity keys are roll numbers: ASCII alphanumerics plus `-` and `_`.
pub fn validate_identity(kind: &str, id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ServiceError::InvalidInput(format!("{kind} {id:?} is not a valid identifier")))
    }
}

/// Trimmed value of a required text field.
pub fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ServiceError::InvalidInput(format!("{field} is required")));
    }
    Ok(value.to_string())
}

pub fn validate_term(term: u8) -> Result<u8> {
    if (1..=10).contains(&term) {
        Ok(term)
    } else {
        Err(ServiceError::InvalidInput(format!("term must be between 1 and 10, got {term}")))
    }
}
