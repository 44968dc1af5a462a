use rollcall_core::{decode_image, DetectedFace, ExtractError, FaceExtractor, RgbImage};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A decoded image and the faces found in it, best detection first.
pub struct Analysis {
    pub image: RgbImage,
    pub faces: Vec<DetectedFace>,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Analyze {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Analysis, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread. The thread exits once every
/// handle has been dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode `bytes`, then detect and embed every face in the image.
    pub async fn analyze(&self, bytes: Vec<u8>) -> Result<Analysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze { bytes, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Move an initialized extractor onto a dedicated OS thread and return a handle to it.
///
/// The extractor is built by the caller (models loaded, fail-fast), so a
/// running engine is always ready to serve.
pub fn spawn_engine<E>(mut extractor: E) -> Result<EngineHandle, EngineError>
where
    E: FaceExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { bytes, reply } => {
                        let result = run_analyze(&mut extractor, &bytes);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_analyze<E: FaceExtractor>(extractor: &mut E, bytes: &[u8]) -> Result<Analysis, EngineError> {
    let started = Instant::now();
    let image = decode_image(bytes)?;
    let faces = extractor.detect_and_embed(&image)?;
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        faces = faces.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "analyze: done"
    );
    Ok(Analysis { image, faces })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{png, FakeExtractor, NO_FACE, POISON};

    #[tokio::test]
    async fn test_analyze_returns_faces() {
        let engine = spawn_engine(FakeExtractor).unwrap();
        let analysis = engine.analyze(png([10, 20, 30])).await.unwrap();
        assert_eq!(analysis.image.dimensions(), (8, 8));
        assert_eq!(analysis.faces.len(), 1);
        assert_eq!(analysis.faces[0].embedding.values, vec![10.0, 20.0, 30.0]);
    }

    #[tokio::test]
    async fn test_analyze_no_face() {
        let engine = spawn_engine(FakeExtractor).unwrap();
        let analysis = engine.analyze(png(NO_FACE)).await.unwrap();
        assert!(analysis.faces.is_empty());
    }

    #[tokio::test]
    async fn test_analyze_errors() {
        let engine = spawn_engine(FakeExtractor).unwrap();

        let err = engine.analyze(Vec::new()).await.err().unwrap();
        assert!(matches!(err, EngineError::Extract(ExtractError::EmptyImage)));

        let err = engine.analyze(b"garbage".to_vec()).await.err().unwrap();
        assert!(matches!(err, EngineError::Extract(ExtractError::Decode(_))));

        let err = engine.analyze(png(POISON)).await.err().unwrap();
        assert!(matches!(err, EngineError::Extract(ExtractError::InferenceFailed(_))));
    }

    #[tokio::test]
    async fn test_handles_share_one_engine() {
        let engine = spawn_engine(FakeExtractor).unwrap();
        let other = engine.clone();
        let (a, b) = tokio::join!(engine.analyze(png([1, 2, 3])), other.analyze(png([4, 5, 6])));
        assert_eq!(a.unwrap().faces[0].embedding.values, vec![1.0, 2.0, 3.0]);
        assert_eq!(b.unwrap().faces[0].embedding.values, vec![4.0, 5.0, 6.0]);
    }
}
