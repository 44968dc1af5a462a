use crate::engine::{EngineError, EngineHandle};
use crate::error::{validate_identity, Result, ServiceError};
use chrono::{DateTime, Utc};
use rollcall_store::Store;
use std::io::ErrorKind;
use std::path::PathBuf;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Thumbnails of unrecognized faces awaiting a decision.
#[derive(Clone)]
pub struct UnknownReview {
    store: Store,
    engine: EngineHandle,
    embedding_dim: usize,
    unknown_dir: PathBuf,
}

impl UnknownReview {
    pub fn new(store: Store, engine: EngineHandle, embedding_dim: usize, unknown_dir: PathBuf) -> Self {
        Self {
            store,
            engine,
            embedding_dim,
            unknown_dir,
        }
    }

    /// Image file names in the review directory, newest name first.
    pub async fn list_unknowns(&self) -> Result<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.unknown_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_failure(&self.unknown_dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_failure(&self.unknown_dir, e))? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let is_image = name
                .rsplit_once('.')
                .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if is_image {
                names.push(name);
            }
        }
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    pub async fn assign_unknown(&self, file_name: &str, person_id: &str) -> Result<u32> {
        self.assign_unknown_at(file_name, person_id, Utc::now()).await
    }

    /// Add the thumbnail's face to `person_id`'s gallery, then drop the
    /// thumbnail. Returns the person's new enrolled image count.
    pub async fn assign_unknown_at(&self, file_name: &str, person_id: &str, now: DateTime<Utc>) -> Result<u32> {
        let path = self.resolve(file_name)?;
        validate_identity("person", person_id)?;
        if self.store.person(person_id).await?.is_none() {
            return Err(ServiceError::PersonNotFound(person_id.to_string()));
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ServiceError::NotFound(format!("unknown face {file_name}")))
            }
            Err(e) => return Err(io_failure(&path, e)),
        };

        let analysis = self.engine.analyze(bytes).await.map_err(|e| match e {
            EngineError::Extract(inner) if inner.is_bad_input() => ServiceError::InvalidInput(inner.to_string()),
            other => ServiceError::EngineFailure(other.to_string()),
        })?;
        let face = analysis
            .faces
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::InvalidInput(format!("no face detected in {file_name}")))?;
        if face.embedding.dim() != self.embedding_dim {
            return Err(ServiceError::EngineFailure(format!(
                "expected {}-dim embedding, got {}",
                self.embedding_dim,
                face.embedding.dim()
            )));
        }

        let count = self
            .store
            .add_embedding(person_id, &face.embedding, now)
            .await?
            .ok_or_else(|| ServiceError::PersonNotFound(person_id.to_string()))?;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(file = file_name, error = %e, "assigned thumbnail could not be removed");
        }
        tracing::info!(file = file_name, person_id, enrolled_images = count, "unknown face assigned");
        Ok(count)
    }

    pub async fn delete_unknown(&self, file_name: &str) -> Result<()> {
        let path = self.resolve(file_name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(file = file_name, "unknown face deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ServiceError::NotFound(format!("unknown face {file_name}"))),
            Err(e) => Err(io_failure(&path, e)),
        }
    }

    /// Path of `file_name` inside the review directory. Only bare names are accepted.
    fn resolve(&self, file_name: &str) -> Result<PathBuf> {
        let bare = !file_name.is_empty()
            && file_name != "."
            && file_name != ".."
            && !file_name.contains(['/', '\\', '\0']);
        if !bare {
            return Err(ServiceError::InvalidInput(format!("{file_name:?} is not a plain file name")));
        }
        Ok(self.unknown_dir.join(file_name))
    }
}

fn io_failure(path: &std::path::Path, e: std::io::Error) -> ServiceError {
    ServiceError::EngineFailure(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::test_support::{at, png, seed_person, test_store, FakeExtractor, NO_FACE, TEST_DIM};

    async fn review() -> (UnknownReview, Store, tempfile::TempDir) {
        let store = test_store().await;
        let dir = tempfile::tempdir().unwrap();
        let review = UnknownReview::new(
            store.clone(),
            spawn_engine(FakeExtractor).unwrap(),
            TEST_DIM,
            dir.path().to_path_buf(),
        );
        (review, store, dir)
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let (review, _store, dir) = review().await;
        for name in ["unknown_100_0.jpg", "unknown_300_1.PNG", "notes.txt", "unknown_200_0.jpeg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let names = review.list_unknowns().await.unwrap();
        assert_eq!(names, ["unknown_300_1.PNG", "unknown_200_0.jpeg", "unknown_100_0.jpg"]);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let store = test_store().await;
        let dir = tempfile::tempdir().unwrap();
        let review = UnknownReview::new(
            store,
            spawn_engine(FakeExtractor).unwrap(),
            TEST_DIM,
            dir.path().join("absent"),
        );
        assert!(review.list_unknowns().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_assign_adds_embedding_and_removes_file() {
        let (review, store, dir) = review().await;
        seed_person(&store, "101", "Asha").await;
        std::fs::write(dir.path().join("unknown_1_0.png"), png([4, 5, 6])).unwrap();

        let count = review.assign_unknown_at("unknown_1_0.png", "101", at(12, 0)).await.unwrap();
        assert_eq!(count, 1);
        let records = store.embeddings_for("101").await.unwrap();
        assert_eq!(records[0].embedding.values, vec![4.0, 5.0, 6.0]);
        assert_eq!(records[0].created_at, at(12, 0));
        assert!(!dir.path().join("unknown_1_0.png").exists());
    }

    #[tokio::test]
    async fn test_assign_rejections() {
        let (review, store, dir) = review().await;
        seed_person(&store, "101", "Asha").await;
        std::fs::write(dir.path().join("blank.png"), png(NO_FACE)).unwrap();

        let err = review.assign_unknown_at("gone.png", "101", at(12, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "not_found");
        let err = review.assign_unknown_at("blank.png", "404", at(12, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "person_not_found");
        let err = review.assign_unknown_at("../blank.png", "101", at(12, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");

        let err = review.assign_unknown_at("blank.png", "101", at(12, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
        assert!(dir.path().join("blank.png").exists());
        let p = store.person("101").await.unwrap().unwrap();
        assert_eq!(p.enroll_failures, 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let (review, _store, dir) = review().await;
        std::fs::write(dir.path().join("unknown_1_0.jpg"), b"x").unwrap();
        review.delete_unknown("unknown_1_0.jpg").await.unwrap();
        assert!(!dir.path().join("unknown_1_0.jpg").exists());

        let err = review.delete_unknown("unknown_1_0.jpg").await.unwrap_err();
        assert_eq!(err.reason(), "not_found");
        let err = review.delete_unknown("..").await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
    }
}
