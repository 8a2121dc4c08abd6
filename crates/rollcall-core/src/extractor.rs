//! Signature extraction seam: encoded photo in, face signature out.

use crate::detector::{DetectorError, FaceDetector};
use crate::imaging;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("malformed image: {0}")]
    Decode(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

impl ExtractionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExtractionError::Timeout(_))
    }
}

/// Turns an encoded photo into a fixed-length signature.
///
/// Implementations hold no session state. `Ok(None)` means the photo decoded
/// fine but contains no detectable face, which is an expected outcome.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Option<Embedding>, ExtractionError>;
}

/// Run an extractor on the blocking pool under a deadline.
///
/// On timeout the worker thread finishes in the background and its result is
/// discarded.
pub async fn extract_within(
    extractor: Arc<dyn EmbeddingExtractor>,
    image: Arc<Vec<u8>>,
    timeout: Duration,
) -> Result<Option<Embedding>, ExtractionError> {
    let job = tokio::task::spawn_blocking(move || extractor.extract(&image));
    match tokio::time::timeout(timeout, job).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ExtractionError::Worker(join.to_string())),
        Err(_) => Err(ExtractionError::Timeout(timeout)),
    }
}

/// Default location of the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}

/// SCRFD detection followed by ArcFace recognition on the most confident face.
pub struct OnnxExtractor {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxExtractor {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractionError> {
        let scrfd = model_dir.join("det_10g.onnx");
        let arcface = model_dir.join("w600k_r50.onnx");
        let detector = FaceDetector::load(&scrfd.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&self, image: &[u8]) -> Result<Option<Embedding>, ExtractionError> {
        let photo = imaging::decode_rgb(image)?;
        let faces = lock(&self.detector).detect(&photo)?;
        let Some(face) = faces.first() else {
            tracing::debug!(width = photo.width(), height = photo.height(), "no face in photo");
            return Ok(None);
        };
        tracing::debug!(confidence = face.confidence, faces = faces.len(), "face selected");

        let embedding = lock(&self.recognizer).extract(&photo, face)?;
        Ok(Some(embedding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    impl EmbeddingExtractor for Slow {
        fn extract(&self, _image: &[u8]) -> Result<Option<Embedding>, ExtractionError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Some(Embedding::new(vec![1.0])))
        }
    }

    #[tokio::test]
    async fn test_extract_within_times_out() {
        let err = extract_within(Arc::new(Slow), Arc::new(vec![]), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_extract_within_returns_result() {
        let sig = extract_within(Arc::new(Slow), Arc::new(vec![]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(sig, Some(Embedding::new(vec![1.0])));
    }

    #[test]
    fn test_load_missing_models() {
        let err = OnnxExtractor::load(Path::new("/nonexistent/models")).err().unwrap();
        assert!(matches!(err, ExtractionError::Detector(DetectorError::ModelNotFound(_))));
    }
}
