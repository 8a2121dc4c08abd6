use crate::cache::{EmbeddingCache, SignatureOrigin};
use crate::extractor::{extract_within, EmbeddingExtractor, ExtractionError};
use crate::roster::{fetch_with_retry, RetryPolicy, RosterError, RosterStore};
use crate::types::{Candidate, CosineMatcher, MatchResult, Matcher, RejectionReason, SessionContext};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;

/// Default largest accepted cosine distance (confidence ≥ 0.55).
pub const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.45;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("roster fetch for class {class_id} failed after {attempts} attempt(s): {source}")]
    RosterFetch {
        class_id: String,
        attempts: u32,
        #[source]
        source: RosterError,
    },
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl RecognitionError {
    pub fn is_timeout(&self) -> bool {
        match self {
            RecognitionError::RosterFetch { source, .. } => matches!(source, RosterError::Timeout(_)),
            RecognitionError::Extraction(e) => e.is_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatchingConfig {
    /// Largest accepted cosine distance.
    pub recognition_threshold: f32,
    pub roster_retry: RetryPolicy,
    /// Deadline for extracting the captured photo's signature.
    pub extraction_timeout: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            recognition_threshold: DEFAULT_RECOGNITION_THRESHOLD,
            roster_retry: RetryPolicy::default(),
            extraction_timeout: Duration::from_secs(10),
        }
    }
}

/// Recognizes a captured photo against a session's roster.
///
/// Safe to share across tasks: per-session state lives in the
/// [`EmbeddingCache`], which coalesces concurrent population.
pub struct FaceMatchingEngine {
    store: Arc<dyn RosterStore>,
    extractor: Arc<dyn EmbeddingExtractor>,
    cache: Arc<EmbeddingCache>,
    config: MatchingConfig,
}

impl FaceMatchingEngine {
    pub fn new(
        store: Arc<dyn RosterStore>,
        extractor: Arc<dyn EmbeddingExtractor>,
        cache: Arc<EmbeddingCache>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn RosterStore> {
        &self.store
    }

    pub async fn recognize(
        &self,
        session: &SessionContext,
        image: &[u8],
    ) -> Result<MatchResult, RecognitionError> {
        let started = Instant::now();
        let policy = self.config.roster_retry;
        let roster = self
            .cache
            .roster(&session.session_id, || async {
                fetch_with_retry(self.store.as_ref(), &session.class_id, policy)
                    .await
                    .map_err(|(source, attempts)| RecognitionError::RosterFetch {
                        class_id: session.class_id.clone(),
                        attempts,
                        source,
                    })
            })
            .await?;

        let probe = extract_within(
            self.extractor.clone(),
            Arc::new(image.to_vec()),
            self.config.extraction_timeout,
        )
        .await?;
        let Some(probe) = probe else {
            tracing::info!(session_id = %session.session_id, "no face detected in captured photo");
            return Ok(MatchResult::rejected(RejectionReason::NoFaceDetected));
        };

        // Resolve every member's signature concurrently; the per-student
        // cells coalesce with any other request for the same session.
        let mut lookups = JoinSet::new();
        for (index, entry) in roster.iter().enumerate() {
            let cache = self.cache.clone();
            let session_id = session.session_id.clone();
            let entry = entry.clone();
            lookups.spawn(async move { (index, cache.get_or_compute(&session_id, &entry).await) });
        }

        let mut resolved = vec![None; roster.len()];
        while let Some(joined) = lookups.join_next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(err) => {
                    tracing::warn!(error = %err, "signature lookup task failed");
                    continue;
                }
            };
            match outcome {
                Ok(cached) => resolved[index] = cached,
                Err(err) if err.is_timeout() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(
                        student_id = %roster[index].student_id,
                        error = %err,
                        "skipping roster member"
                    );
                }
            }
        }

        let mut candidates = Vec::with_capacity(roster.len());
        let (mut reused, mut extracted) = (0usize, 0usize);
        for (entry, cached) in roster.iter().zip(resolved) {
            let Some(cached) = cached else { continue };
            match cached.origin {
                SignatureOrigin::Extracted => extracted += 1,
                _ => reused += 1,
            }
            candidates.push(Candidate {
                student_id: entry.student_id.clone(),
                display_name: entry.display_name.clone(),
                signature: cached.signature.clone(),
            });
        }

        let result = CosineMatcher.compare(&probe, &candidates, self.config.recognition_threshold);
        tracing::info!(
            session_id = %session.session_id,
            class_id = %session.class_id,
            roster = roster.len(),
            candidates = candidates.len(),
            reused,
            extracted,
            matched = result.matched,
            student_id = result.student_id.as_deref().unwrap_or(""),
            confidence = result.confidence,
            reason = ?result.reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recognition complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, PrecomputedSignatures};
    use crate::roster::MemoryRoster;
    use crate::types::{AttendanceStatus, Embedding, RosterEntry};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Photo bytes are little-endian f32s; empty means no face, a leading
    /// `!` means an undecodable file. Calls are counted per photo.
    #[derive(Default)]
    struct FakeExtractor {
        calls: Mutex<HashMap<Vec<u8>, usize>>,
    }

    impl FakeExtractor {
        fn calls_for(&self, image: &[u8]) -> usize {
            self.calls.lock().unwrap().get(image).copied().unwrap_or(0)
        }
    }

    impl EmbeddingExtractor for FakeExtractor {
        fn extract(&self, image: &[u8]) -> Result<Option<Embedding>, ExtractionError> {
            *self.calls.lock().unwrap().entry(image.to_vec()).or_default() += 1;
            std::thread::sleep(Duration::from_millis(20));
            if image.first() == Some(&b'!') {
                return Err(ExtractionError::Decode("not an image".into()));
            }
            if image.is_empty() {
                return Ok(None);
            }
            Ok(Some(Embedding::new(
                image
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )))
        }
    }

    fn photo(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn session() -> SessionContext {
        SessionContext::new("sess-1", "Algo", "GI-2", None, None).unwrap()
    }

    fn engine(store: Arc<dyn RosterStore>, extractor: Arc<FakeExtractor>, threshold: f32) -> FaceMatchingEngine {
        let cache = Arc::new(EmbeddingCache::new(
            extractor.clone(),
            Arc::new(PrecomputedSignatures::empty()),
            CacheConfig::default(),
        ));
        FaceMatchingEngine::new(
            store,
            extractor,
            cache,
            MatchingConfig {
                recognition_threshold: threshold,
                ..MatchingConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_matches_student_k_for_any_roster_size() {
        for n in 1..=6usize {
            for k in 0..n {
                let entries = (0..n)
                    .map(|i| {
                        let mut v = vec![0.0f32; n];
                        v[i] = 1.0;
                        RosterEntry::new(format!("s{i}"), format!("Student {i}")).with_signature(Embedding::new(v))
                    })
                    .collect();
                let store = Arc::new(MemoryRoster::new());
                store.insert_class("gi-2", entries);

                let mut probe = vec![0.0f32; n];
                probe[k] = 1.0;
                let result = engine(store, Arc::new(FakeExtractor::default()), DEFAULT_RECOGNITION_THRESHOLD)
                    .recognize(&session(), &photo(&probe))
                    .await
                    .unwrap();

                assert!(result.matched, "n={n} k={k}");
                assert_eq!(result.student_id, Some(format!("s{k}")));
                assert!((result.confidence - 1.0).abs() < 1e-5);
            }
        }
    }

    #[tokio::test]
    async fn test_two_student_threshold_scenario() {
        let store = Arc::new(MemoryRoster::new());
        store.insert_class(
            "gi-2",
            vec![
                RosterEntry::new("s1", "Ada").with_signature(Embedding::new(vec![1.0, 0.0])),
                RosterEntry::new("s2", "Bob").with_signature(Embedding::new(vec![0.0, 1.0])),
            ],
        );
        let engine = engine(store, Arc::new(FakeExtractor::default()), 0.1);

        let hit = engine.recognize(&session(), &photo(&[0.95, 0.05])).await.unwrap();
        assert!(hit.matched);
        assert_eq!(hit.student_id.as_deref(), Some("s1"));
        assert_eq!(hit.student_name.as_deref(), Some("Ada"));

        let miss = engine.recognize(&session(), &photo(&[0.5, 0.5])).await.unwrap();
        assert!(!miss.matched);
        assert_eq!(miss.reason, Some(RejectionReason::LowConfidence));
    }

    #[tokio::test]
    async fn test_no_face_regardless_of_roster() {
        for roster in [
            vec![],
            vec![RosterEntry::new("s1", "Ada").with_signature(Embedding::new(vec![1.0]))],
        ] {
            let store = Arc::new(MemoryRoster::new());
            store.insert_class("gi-2", roster);
            let result = engine(store, Arc::new(FakeExtractor::default()), 0.45)
                .recognize(&session(), &[])
                .await
                .unwrap();
            assert!(!result.matched);
            assert_eq!(result.reason, Some(RejectionReason::NoFaceDetected));
        }
    }

    #[tokio::test]
    async fn test_empty_roster_has_no_candidates() {
        let store = Arc::new(MemoryRoster::new());
        let result = engine(store, Arc::new(FakeExtractor::default()), 0.45)
            .recognize(&session(), &photo(&[1.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(result.reason, Some(RejectionReason::NoCandidates));
    }

    #[tokio::test]
    async fn test_malformed_capture_is_an_error() {
        let store = Arc::new(MemoryRoster::new());
        let err = engine(store, Arc::new(FakeExtractor::default()), 0.45)
            .recognize(&session(), b"!garbage")
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Extraction(ExtractionError::Decode(_))));
    }

    #[tokio::test]
    async fn test_unreadable_reference_photo_is_skipped() {
        let store = Arc::new(MemoryRoster::new());
        store.insert_class(
            "gi-2",
            vec![
                RosterEntry::new("s0", "Broken").with_reference_image(b"!corrupt".to_vec()),
                RosterEntry::new("s1", "Ada").with_reference_image(photo(&[1.0, 0.0])),
            ],
        );
        let result = engine(store, Arc::new(FakeExtractor::default()), 0.45)
            .recognize(&session(), &photo(&[1.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(result.student_id.as_deref(), Some("s1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recognitions_extract_reference_once() {
        let reference = photo(&[0.0, 1.0, 0.0]);
        let store = Arc::new(MemoryRoster::new());
        store.insert_class(
            "gi-2",
            vec![RosterEntry::new("new", "Newcomer").with_reference_image(reference.clone())],
        );
        let extractor = Arc::new(FakeExtractor::default());
        let engine = Arc::new(engine(store, extractor.clone(), 0.45));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.recognize(&session(), &photo(&[0.0, 1.0, 0.01])).await })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }

        assert_eq!(extractor.calls_for(&reference), 1);
        assert!(results.iter().all(|r| r.matched && r.student_id.as_deref() == Some("new")));
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    /// Blocks every extraction until `parties` of them are in flight at once.
    struct Rendezvous {
        barrier: std::sync::Barrier,
    }

    impl EmbeddingExtractor for Rendezvous {
        fn extract(&self, image: &[u8]) -> Result<Option<Embedding>, ExtractionError> {
            if image.first() == Some(&b'r') {
                self.barrier.wait();
            }
            let mut values = vec![0.0f32; 4];
            values[usize::from(image[image.len() - 1] % 4)] = 1.0;
            Ok(Some(Embedding::new(values)))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reference_signatures_resolve_concurrently() {
        let store = Arc::new(MemoryRoster::new());
        store.insert_class(
            "gi-2",
            (0..4u8)
                .map(|i| RosterEntry::new(format!("s{i}"), format!("Student {i}")).with_reference_image(vec![b'r', i]))
                .collect(),
        );
        let extractor = Arc::new(Rendezvous {
            barrier: std::sync::Barrier::new(4),
        });
        let cache = Arc::new(EmbeddingCache::new(
            extractor.clone(),
            Arc::new(PrecomputedSignatures::empty()),
            CacheConfig::default(),
        ));
        let engine = FaceMatchingEngine::new(store, extractor, cache, MatchingConfig::default());

        let result = tokio::time::timeout(Duration::from_secs(5), engine.recognize(&session(), b"p\x02"))
            .await
            .expect("reference extractions ran one at a time")
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.student_id.as_deref(), Some("s2"));
        assert_eq!(engine.cache().cached_students("sess-1"), 4);
    }

    struct Down;

    #[async_trait]
    impl RosterStore for Down {
        async fn fetch_roster(&self, _class_id: &str) -> Result<Vec<RosterEntry>, RosterError> {
            Err(RosterError::Unavailable("connection refused".into()))
        }

        async fn upsert_attendance(
            &self,
            _session_id: &str,
            _student_id: &str,
            _status: AttendanceStatus,
        ) -> Result<(), RosterError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_roster_failure_surfaces_after_retries() {
        let mut engine = engine(Arc::new(Down), Arc::new(FakeExtractor::default()), 0.45);
        engine.config.roster_retry = RetryPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(1),
        };
        let err = engine.recognize(&session(), &photo(&[1.0])).await.unwrap_err();
        match err {
            RecognitionError::RosterFetch { attempts, class_id, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(class_id, "gi-2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
