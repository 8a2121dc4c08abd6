//! rollcall-core: Face matching for classroom attendance.
//!
//! SCRFD detection and ArcFace signatures run via ONNX Runtime on the CPU.
//! On top of that sit the session-scoped embedding cache, the roster matcher
//! and attendance write-back through the [`RosterStore`] seam.

pub mod alignment;
pub mod attendance;
pub mod cache;
pub mod detector;
pub mod engine;
pub mod extractor;
pub mod imaging;
pub mod recognizer;
pub mod roster;
pub mod types;

pub use attendance::{AttendanceOutcome, AttendanceRecorder};
pub use cache::{CacheConfig, CacheEntry, EmbeddingCache, PrecomputedSignatures, SignatureSource};
pub use detector::FaceDetector;
pub use engine::{FaceMatchingEngine, MatchingConfig, RecognitionError, DEFAULT_RECOGNITION_THRESHOLD};
pub use extractor::{default_model_dir, EmbeddingExtractor, ExtractionError, OnnxExtractor};
pub use recognizer::FaceRecognizer;
pub use roster::{MemoryRoster, RetryPolicy, RosterError, RosterStore};
pub use types::{
    normalize_class_id, AttendanceStatus, BoundingBox, Embedding, MatchResult, RejectionReason,
    RosterEntry, SessionContext,
};
