//! Session-scoped, request-coalescing embedding cache.
//!
//! Each (session, student) pair owns a once-cell: the first caller computes
//! the signature and every concurrent caller awaits that same computation.
//! Populated cells are never invalidated while the session lives; the whole
//! session map is dropped on eviction.

use crate::extractor::{extract_within, EmbeddingExtractor, ExtractionError};
use crate::types::{Embedding, RosterEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

/// Read-only source of signatures shared by all sessions.
pub trait SignatureSource: Send + Sync {
    fn lookup(&self, student_id: &str) -> Option<Embedding>;
}

/// Signatures precomputed out of band, loaded once at startup.
#[derive(Debug, Default)]
pub struct PrecomputedSignatures {
    by_student: HashMap<String, Embedding>,
}

impl PrecomputedSignatures {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(by_student: HashMap<String, Embedding>) -> Self {
        Self { by_student }
    }

    pub fn len(&self) -> usize {
        self.by_student.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_student.is_empty()
    }
}

impl SignatureSource for PrecomputedSignatures {
    fn lookup(&self, student_id: &str) -> Option<Embedding> {
        self.by_student.get(student_id).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureOrigin {
    /// Global precomputed store.
    Global,
    /// Signature carried on the roster entry.
    Roster,
    /// Extracted from the roster entry's reference photo.
    Extracted,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub student_id: String,
    pub signature: Arc<Embedding>,
    pub extracted_at: DateTime<Utc>,
    pub origin: SignatureOrigin,
}

/// `None` marks a student whose reference photo yields no signature.
type Slot = Arc<OnceCell<Option<Arc<CacheEntry>>>>;

struct SessionCache {
    roster: OnceCell<Arc<Vec<RosterEntry>>>,
    students: Mutex<HashMap<String, Slot>>,
    last_used: Mutex<Instant>,
}

impl SessionCache {
    fn new() -> Self {
        Self {
            roster: OnceCell::new(),
            students: Mutex::new(HashMap::new()),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn slot(&self, student_id: &str) -> Slot {
        let mut students = self.students.lock().unwrap_or_else(|p| p.into_inner());
        students
            .entry(student_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Deadline for extracting one reference photo.
    pub extraction_timeout: Duration,
    /// Sessions untouched for this long are dropped by [`EmbeddingCache::sweep_idle`].
    pub idle_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            extraction_timeout: Duration::from_secs(10),
            idle_ttl: Duration::from_secs(2 * 60 * 60),
        }
    }
}

pub struct EmbeddingCache {
    extractor: Arc<dyn EmbeddingExtractor>,
    global: Arc<dyn SignatureSource>,
    sessions: RwLock<HashMap<String, Arc<SessionCache>>>,
    config: CacheConfig,
}

impl EmbeddingCache {
    pub fn new(
        extractor: Arc<dyn EmbeddingExtractor>,
        global: Arc<dyn SignatureSource>,
        config: CacheConfig,
    ) -> Self {
        Self {
            extractor,
            global,
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn session(&self, session_id: &str) -> Arc<SessionCache> {
        let existing = self
            .sessions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .cloned();
        let session = match existing {
            Some(session) => session,
            None => {
                let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
                sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| {
                        tracing::info!(session_id, "initialized embedding cache for session");
                        Arc::new(SessionCache::new())
                    })
                    .clone()
            }
        };
        session.touch();
        session
    }

    /// The session's roster, fetched once through `fetch` and shared afterwards.
    ///
    /// A failed fetch leaves nothing behind; the next caller fetches again.
    pub async fn roster<F, Fut, E>(&self, session_id: &str, fetch: F) -> Result<Arc<Vec<RosterEntry>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<RosterEntry>, E>>,
    {
        let session = self.session(session_id);
        session
            .roster
            .get_or_try_init(|| async move { fetch().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Signature for `entry` within `session_id`, computed at most once.
    ///
    /// Lookup order: global precomputed store, the entry's own signature, then
    /// extraction from its reference photo. Returns `Ok(None)` for students
    /// with no usable signature.
    pub async fn get_or_compute(
        &self,
        session_id: &str,
        entry: &RosterEntry,
    ) -> Result<Option<Arc<CacheEntry>>, ExtractionError> {
        let slot = self.session(session_id).slot(&entry.student_id);
        let cached = slot
            .get_or_try_init(|| self.compute(session_id, entry))
            .await?;
        Ok(cached.clone())
    }

    async fn compute(
        &self,
        session_id: &str,
        entry: &RosterEntry,
    ) -> Result<Option<Arc<CacheEntry>>, ExtractionError> {
        let found = |signature: Embedding, origin| {
            Some(Arc::new(CacheEntry {
                student_id: entry.student_id.clone(),
                signature: Arc::new(signature),
                extracted_at: Utc::now(),
                origin,
            }))
        };

        if let Some(signature) = self.global.lookup(&entry.student_id) {
            return Ok(found(signature, SignatureOrigin::Global));
        }
        if let Some(signature) = &entry.signature {
            return Ok(found(signature.clone(), SignatureOrigin::Roster));
        }
        let Some(image) = entry.reference_image.clone() else {
            tracing::debug!(student_id = %entry.student_id, "student has no reference photo");
            return Ok(None);
        };

        let started = Instant::now();
        match extract_within(self.extractor.clone(), image, self.config.extraction_timeout).await {
            Ok(Some(signature)) => {
                tracing::debug!(
                    session_id,
                    student_id = %entry.student_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "extracted reference signature"
                );
                Ok(found(signature, SignatureOrigin::Extracted))
            }
            Ok(None) => {
                tracing::warn!(student_id = %entry.student_id, "no face in reference photo");
                Ok(None)
            }
            Err(ExtractionError::Decode(reason)) => {
                tracing::warn!(student_id = %entry.student_id, %reason, "unreadable reference photo");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop everything cached for a session.
    pub fn evict_session(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id)
            .is_some();
        if removed {
            tracing::info!(session_id, "cleared embedding cache for session");
        }
        removed
    }

    /// Drop sessions idle for longer than the configured TTL.
    pub fn sweep_idle(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| s.idle_for() <= self.config.idle_ttl);
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::info!(evicted, "swept idle embedding caches");
        }
        evicted
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Students with a settled cell (signature or known-unusable) in a session.
    pub fn cached_students(&self, session_id: &str) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        sessions.get(session_id).map_or(0, |s| {
            s.students
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .values()
                .filter(|slot| slot.initialized())
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reads the signature straight out of the "photo" bytes: one f32 per
    /// 4 bytes, little endian. Empty photos have no face.
    struct Counting {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Counting {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }
    }

    impl EmbeddingExtractor for Counting {
        fn extract(&self, image: &[u8]) -> Result<Option<Embedding>, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if image.is_empty() {
                return Ok(None);
            }
            let values = image
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Ok(Some(Embedding::new(values)))
        }
    }

    fn photo(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn cache(extractor: Arc<Counting>, global: PrecomputedSignatures) -> EmbeddingCache {
        EmbeddingCache::new(extractor, Arc::new(global), CacheConfig::default())
    }

    #[tokio::test]
    async fn test_second_lookup_reuses_signature() {
        let extractor = Counting::new(Duration::ZERO);
        let cache = cache(extractor.clone(), PrecomputedSignatures::empty());
        let entry = RosterEntry::new("s1", "Ada").with_reference_image(photo(&[0.25, 0.5]));

        let first = cache.get_or_compute("sess", &entry).await.unwrap().unwrap();
        let second = cache.get_or_compute("sess", &entry).await.unwrap().unwrap();

        assert_eq!(first.signature.values, second.signature.values);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.origin, SignatureOrigin::Extracted);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lookups_coalesce() {
        let extractor = Counting::new(Duration::from_millis(50));
        let cache = Arc::new(cache(extractor.clone(), PrecomputedSignatures::empty()));
        let entry = RosterEntry::new("s1", "Ada").with_reference_image(photo(&[1.0, 0.0]));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let entry = entry.clone();
                tokio::spawn(async move { cache.get_or_compute("sess", &entry).await })
            })
            .collect();

        for task in tasks {
            let got = task.await.unwrap().unwrap().unwrap();
            assert_eq!(got.signature.values, vec![1.0, 0.0]);
        }
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_precomputed_paths_skip_extraction() {
        let extractor = Counting::new(Duration::ZERO);
        let global = PrecomputedSignatures::from_map(HashMap::from([(
            "g1".to_string(),
            Embedding::new(vec![0.0, 1.0]),
        )]));
        let cache = cache(extractor.clone(), global);

        let from_global = RosterEntry::new("g1", "Grace")
            .with_signature(Embedding::new(vec![9.0, 9.0]))
            .with_reference_image(photo(&[1.0, 1.0]));
        let from_roster = RosterEntry::new("r1", "Rosa").with_signature(Embedding::new(vec![1.0, 0.0]));

        let g = cache.get_or_compute("sess", &from_global).await.unwrap().unwrap();
        let r = cache.get_or_compute("sess", &from_roster).await.unwrap().unwrap();

        assert_eq!(g.origin, SignatureOrigin::Global);
        assert_eq!(g.signature.values, vec![0.0, 1.0]);
        assert_eq!(r.origin, SignatureOrigin::Roster);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_faceless_reference_is_remembered() {
        let extractor = Counting::new(Duration::ZERO);
        let cache = cache(extractor.clone(), PrecomputedSignatures::empty());
        let entry = RosterEntry::new("s1", "Ada").with_reference_image(Vec::new());

        assert!(cache.get_or_compute("sess", &entry).await.unwrap().is_none());
        assert!(cache.get_or_compute("sess", &entry).await.unwrap().is_none());
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_students("sess"), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_and_evictable() {
        let extractor = Counting::new(Duration::ZERO);
        let cache = cache(extractor.clone(), PrecomputedSignatures::empty());
        let entry = RosterEntry::new("s1", "Ada").with_reference_image(photo(&[1.0]));

        cache.get_or_compute("a", &entry).await.unwrap();
        cache.get_or_compute("b", &entry).await.unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.session_count(), 2);

        assert!(cache.evict_session("a"));
        assert!(!cache.evict_session("a"));
        cache.get_or_compute("a", &entry).await.unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_leaves_slot_empty() {
        let extractor = Counting::new(Duration::from_millis(100));
        let cache = EmbeddingCache::new(
            extractor.clone(),
            Arc::new(PrecomputedSignatures::empty()),
            CacheConfig {
                extraction_timeout: Duration::from_millis(5),
                idle_ttl: Duration::from_secs(60),
            },
        );
        let entry = RosterEntry::new("s1", "Ada").with_reference_image(photo(&[1.0]));

        let err = cache.get_or_compute("sess", &entry).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(cache.cached_students("sess"), 0);
    }

    #[tokio::test]
    async fn test_roster_fetched_once_per_session() {
        let cache = cache(Counting::new(Duration::ZERO), PrecomputedSignatures::empty());
        let fetches = AtomicUsize::new(0);
        for _ in 0..3 {
            let roster = cache
                .roster("sess", || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(vec![RosterEntry::new("s1", "Ada")])
                })
                .await
                .unwrap();
            assert_eq!(roster.len(), 1);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sweep_idle_drops_stale_sessions() {
        let cache = EmbeddingCache::new(
            Counting::new(Duration::ZERO),
            Arc::new(PrecomputedSignatures::empty()),
            CacheConfig {
                extraction_timeout: Duration::from_secs(1),
                idle_ttl: Duration::ZERO,
            },
        );
        let entry = RosterEntry::new("s1", "Ada").with_signature(Embedding::new(vec![1.0]));
        cache.get_or_compute("sess", &entry).await.unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.sweep_idle(), 1);
        assert_eq!(cache.session_count(), 0);
    }
}
