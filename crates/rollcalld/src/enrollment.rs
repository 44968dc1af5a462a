//! Enrollment quality gate.
//!
//! Each uploaded image either adds a vector to the person's gallery or counts
//! as a failure. Failures never reset; at [`MAX_ENROLL_FAILURES`] the person
//! and every vector it owns are deleted and the caller must register again.

use crate::engine::{EngineError, EngineHandle};
use crate::error::{validate_identity, Result, ServiceError};
use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, ExtractError};
use rollcall_store::{EnrollmentStatus, Person, Store};

pub const MAX_ENROLL_FAILURES: u32 = 5;

#[derive(Clone)]
pub struct EnrollmentTracker {
    store: Store,
    engine: EngineHandle,
    embedding_dim: usize,
}

impl EnrollmentTracker {
    pub fn new(store: Store, engine: EngineHandle, embedding_dim: usize) -> Self {
        Self {
            store,
            engine,
            embedding_dim,
        }
    }

    /// Run one enrollment image through the extractor. Returns the person's
    /// enrolled image count on success.
    pub async fn register_attempt(&self, person_id: &str, image: Vec<u8>) -> Result<u32> {
        self.register_attempt_at(person_id, image, Utc::now()).await
    }

    pub async fn register_attempt_at(&self, person_id: &str, image: Vec<u8>, now: DateTime<Utc>) -> Result<u32> {
        validate_identity("person", person_id)?;
        let person = self
            .store
            .person(person_id)
            .await?
            .ok_or_else(|| ServiceError::PersonNotFound(person_id.to_string()))?;
        if person.enrollment_status == EnrollmentStatus::Completed {
            return Err(ServiceError::InvalidInput(format!(
                "enrollment for {person_id} is already completed"
            )));
        }

        let embedding = match self.extract(image).await {
            Ok(embedding) => embedding,
            Err(cause) => return Err(self.record_failure(person_id, cause).await),
        };

        let count = self
            .store
            .add_embedding(person_id, &embedding, now)
            .await?
            .ok_or_else(|| ServiceError::PersonNotFound(person_id.to_string()))?;
        tracing::info!(person_id, enrolled_images = count, "enrollment image accepted");
        Ok(count)
    }

    /// Close enrollment. A person with no accepted images is deleted.
    pub async fn finalize(&self, person_id: &str) -> Result<Person> {
        validate_identity("person", person_id)?;
        let mut person = self
            .store
            .person(person_id)
            .await?
            .ok_or_else(|| ServiceError::PersonNotFound(person_id.to_string()))?;

        if person.enrolled_images == 0 {
            self.store.delete_person(person_id).await?;
            tracing::warn!(person_id, "finalize without images; person removed");
            return Err(ServiceError::NoImagesEnrolled(person_id.to_string()));
        }

        self.store
            .set_enrollment_status(person_id, EnrollmentStatus::Completed)
            .await?;
        person.enrollment_status = EnrollmentStatus::Completed;
        tracing::info!(person_id, enrolled_images = person.enrolled_images, "enrollment completed");
        Ok(person)
    }

    /// First detected face's vector, or a description of why there is none.
    async fn extract(&self, image: Vec<u8>) -> std::result::Result<Embedding, String> {
        if image.is_empty() {
            return Err(ExtractError::EmptyImage.to_string());
        }
        let analysis = self.engine.analyze(image).await.map_err(|e| match e {
            EngineError::Extract(inner) => inner.to_string(),
            other => other.to_string(),
        })?;
        let face = analysis
            .faces
            .into_iter()
            .next()
            .ok_or_else(|| "no face detected".to_string())?;
        if face.embedding.dim() != self.embedding_dim {
            return Err(format!(
                "expected {}-dim embedding, got {}",
                self.embedding_dim,
                face.embedding.dim()
            ));
        }
        Ok(face.embedding)
    }

    async fn record_failure(&self, person_id: &str, cause: String) -> ServiceError {
        let failures = match self.store.record_enroll_failure(person_id).await {
            Ok(Some(n)) => n,
            Ok(None) => return ServiceError::PersonNotFound(person_id.to_string()),
            Err(e) => return e.into(),
        };

        if failures < MAX_ENROLL_FAILURES {
            tracing::info!(person_id, failures, %cause, "enrollment attempt failed");
            return ServiceError::EnrollmentAttemptFailed {
                person_id: person_id.to_string(),
                failures,
                cause,
            };
        }

        if let Err(e) = self.store.delete_person(person_id).await {
            return e.into();
        }
        tracing::warn!(person_id, failures, %cause, "enrollment aborted; person and embeddings removed");
        ServiceError::EnrollmentAborted {
            person_id: person_id.to_string(),
            failures,
            cause,
        }
    }
}
