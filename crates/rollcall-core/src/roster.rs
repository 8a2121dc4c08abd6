//! Roster Store Adapter seam and the retrying roster fetch.

use crate::types::{normalize_class_id, AttendanceStatus, MatchResult, RosterEntry, SessionContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RosterError {
    /// Transient backend trouble; safe to retry.
    #[error("roster store unavailable: {0}")]
    Unavailable(String),
    #[error("roster fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("roster store rejected the request: {0}")]
    Rejected(String),
}

impl RosterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RosterError::Unavailable(_) | RosterError::Timeout(_))
    }
}

/// External source of truth for rosters and attendance records.
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// All students of `class_id` (already normalized by the caller).
    async fn fetch_roster(&self, class_id: &str) -> Result<Vec<RosterEntry>, RosterError>;

    /// Create or update the record keyed by (session, student). Idempotent.
    async fn upsert_attendance(
        &self,
        session_id: &str,
        student_id: &str,
        status: AttendanceStatus,
    ) -> Result<(), RosterError>;

    /// Keep the captured photo for auditing. Stores that do not archive ignore it.
    async fn archive_capture(
        &self,
        _session: &SessionContext,
        _image: &[u8],
        _result: &MatchResult,
    ) -> Result<(), RosterError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// Fetch a roster, retrying transient failures with exponential backoff.
///
/// Returns the last error and the number of attempts made.
pub async fn fetch_with_retry(
    store: &dyn RosterStore,
    class_id: &str,
    policy: RetryPolicy,
) -> Result<Vec<RosterEntry>, (RosterError, u32)> {
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=attempts {
        let outcome = tokio::time::timeout(policy.attempt_timeout, store.fetch_roster(class_id))
            .await
            .unwrap_or(Err(RosterError::Timeout(policy.attempt_timeout)));

        match outcome {
            Ok(entries) => {
                tracing::debug!(class_id, attempt, students = entries.len(), "roster fetched");
                return Ok(entries);
            }
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(class_id, attempt, error = %err, ?backoff, "roster fetch failed; retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => return Err((err, attempt)),
        }
    }
    unreachable!("loop returns on the final attempt")
}

/// In-memory roster store.
///
/// Backs tests and embedders that keep rosters elsewhere. Attendance is a
/// map keyed by (session, student), so repeated upserts keep one record.
#[derive(Default)]
pub struct MemoryRoster {
    classes: Mutex<HashMap<String, Vec<RosterEntry>>>,
    attendance: Mutex<HashMap<(String, String), AttendanceStatus>>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_class(&self, class_id: &str, entries: Vec<RosterEntry>) {
        self.classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(normalize_class_id(class_id), entries);
    }

    pub fn attendance(&self) -> Vec<(String, String, AttendanceStatus)> {
        let mut rows: Vec<_> = self
            .attendance
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|((s, st), status)| (s.clone(), st.clone(), *status))
            .collect();
        rows.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        rows
    }
}

#[async_trait]
impl RosterStore for MemoryRoster {
    async fn fetch_roster(&self, class_id: &str) -> Result<Vec<RosterEntry>, RosterError> {
        Ok(self
            .classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(class_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_attendance(
        &self,
        session_id: &str,
        student_id: &str,
        status: AttendanceStatus,
    ) -> Result<(), RosterError> {
        self.attendance
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((session_id.to_string(), student_id.to_string()), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: RosterError,
    }

    #[async_trait]
    impl RosterStore for Flaky {
        async fn fetch_roster(&self, _class_id: &str) -> Result<Vec<RosterEntry>, RosterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(self.error.clone())
            } else {
                Ok(vec![RosterEntry::new("s1", "Ada")])
            }
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

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let store = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            error: RosterError::Unavailable("503".into()),
        };
        let roster = fetch_with_retry(&store, "gi-2", policy()).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_bounded_attempts() {
        let store = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: RosterError::Unavailable("503".into()),
        };
        let (err, attempts) = fetch_with_retry(&store, "gi-2", policy()).await.unwrap_err();
        assert!(matches!(err, RosterError::Unavailable(_)));
        assert_eq!(attempts, 3);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_skips_permanent_errors() {
        let store = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: RosterError::Rejected("bad class".into()),
        };
        let (_, attempts) = fetch_with_retry(&store, "gi-2", policy()).await.unwrap_err();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_memory_upsert_is_idempotent() {
        let store = MemoryRoster::new();
        store.upsert_attendance("sess", "s1", AttendanceStatus::Present).await.unwrap();
        store.upsert_attendance("sess", "s1", AttendanceStatus::Present).await.unwrap();
        assert_eq!(
            store.attendance(),
            vec![("sess".to_string(), "s1".to_string(), AttendanceStatus::Present)]
        );
    }

    #[tokio::test]
    async fn test_memory_class_lookup_is_normalized() {
        let store = MemoryRoster::new();
        store.insert_class(" GI-2 ", vec![RosterEntry::new("s1", "Ada")]);
        assert_eq!(store.fetch_roster("gi-2").await.unwrap().len(), 1);
        assert!(store.fetch_roster("gi-3").await.unwrap().is_empty());
    }
}
