//! SQLite-backed roster, signature and attendance storage.

use crate::error::StoreError;
use crate::migrations::run_migrations;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{
    normalize_class_id, AttendanceStatus, Embedding, MatchResult, PrecomputedSignatures,
    RosterEntry, RosterError, RosterStore, SessionContext,
};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tokio_rusqlite::Connection;

/// A student as written by `rollcall enroll`.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub id: String,
    pub display_name: String,
    pub class_id: String,
    pub reference_image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentSummary {
    pub id: String,
    pub display_name: String,
    pub class_id: String,
    pub has_reference_image: bool,
    pub has_signature: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub session_id: String,
    pub student_id: String,
    pub display_name: Option<String>,
    pub status: AttendanceStatus,
    pub marked_at: String,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).await?;
        conn.call(|c| {
            match c.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
                Ok(mode) => tracing::debug!(%mode, "journal mode set"),
                Err(err) => tracing::warn!(error = %err, "failed to enable WAL mode"),
            }
            Ok(())
        })
        .await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.pragma_update(None, "foreign_keys", "ON")?;
            Ok(run_migrations(c))
        })
        .await??;
        Ok(Self { conn })
    }

    /// Insert or replace a student. The class id is normalized on the way in.
    pub async fn enroll_student(&self, student: NewStudent) -> Result<(), StoreError> {
        let class_id = normalize_class_id(&student.class_id);
        let id = student.id.trim().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO students (id, display_name, class_id, reference_image, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        display_name = excluded.display_name,
                        class_id = excluded.class_id,
                        reference_image = COALESCE(excluded.reference_image, students.reference_image)",
                    params![id, student.display_name.trim(), class_id, student.reference_image, now],
                )?;
                // A new photo invalidates the stored signature.
                if student.reference_image.is_some() {
                    c.execute("DELETE FROM signatures WHERE student_id = ?1", params![id])?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Store a precomputed signature for the global store.
    pub async fn save_signature(&self, student_id: &str, signature: &Embedding) -> Result<(), StoreError> {
        let vector = serde_json::to_string(&signature.values).map_err(|e| StoreError::Corrupt {
            table: "signatures",
            reason: e.to_string(),
        })?;
        let student_id = student_id.to_string();
        let model_version = signature.model_version.clone();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO signatures (student_id, vector, model_version, computed_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(student_id) DO UPDATE SET
                        vector = excluded.vector,
                        model_version = excluded.model_version,
                        computed_at = excluded.computed_at",
                    params![student_id, vector, model_version, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Every stored signature, keyed by student.
    pub async fn load_precomputed(&self) -> Result<PrecomputedSignatures, StoreError> {
        let rows = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare("SELECT student_id, vector, model_version FROM signatures")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut by_student = HashMap::with_capacity(rows.len());
        for (student_id, vector, model_version) in rows {
            let signature = parse_signature(&vector, model_version)?;
            by_student.insert(student_id, signature);
        }
        tracing::info!(signatures = by_student.len(), "loaded precomputed signatures");
        Ok(PrecomputedSignatures::from_map(by_student))
    }

    /// Students of a class (all classes when `None`) with a photo but no signature.
    pub async fn pending_signatures(
        &self,
        class_id: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let class_id = class_id.map(normalize_class_id);
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT s.id, s.reference_image FROM students s
                     LEFT JOIN signatures g ON g.student_id = s.id
                     WHERE s.reference_image IS NOT NULL AND g.student_id IS NULL
                       AND (?1 IS NULL OR s.class_id = ?1)
                     ORDER BY s.id",
                )?;
                let rows = stmt
                    .query_map(params![class_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn list_roster(&self, class_id: &str) -> Result<Vec<StudentSummary>, StoreError> {
        let class_id = normalize_class_id(class_id);
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT s.id, s.display_name, s.class_id,
                            s.reference_image IS NOT NULL, g.student_id IS NOT NULL
                     FROM students s
                     LEFT JOIN signatures g ON g.student_id = s.id
                     WHERE s.class_id = ?1
                     ORDER BY s.display_name, s.id",
                )?;
                let rows = stmt
                    .query_map(params![class_id], |row| {
                        Ok(StudentSummary {
                            id: row.get(0)?,
                            display_name: row.get(1)?,
                            class_id: row.get(2)?,
                            has_reference_image: row.get(3)?,
                            has_signature: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn list_attendance(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        let session_id = session_id.to_string();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT a.id, a.session_id, a.student_id, s.display_name, a.status, a.marked_at
                     FROM attendance a
                     LEFT JOIN students s ON s.id = a.student_id
                     WHERE a.session_id = ?1
                     ORDER BY a.marked_at, a.student_id",
                )?;
                let rows = stmt
                    .query_map(params![session_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, session_id, student_id, display_name, status, marked_at)| {
                let status = AttendanceStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
                    table: "attendance",
                    reason: format!("unknown status '{status}'"),
                })?;
                Ok(AttendanceRecord {
                    id,
                    session_id,
                    student_id,
                    display_name,
                    status,
                    marked_at,
                })
            })
            .collect()
    }

    /// Number of archived captures for a session.
    pub async fn capture_count(&self, session_id: &str) -> Result<usize, StoreError> {
        let session_id = session_id.to_string();
        let count = self
            .conn
            .call(move |c| {
                let n: i64 = c.query_row(
                    "SELECT COUNT(*) FROM captures WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(count.max(0) as usize)
    }

    /// Display name of a single student, if enrolled.
    pub async fn student_name(&self, student_id: &str) -> Result<Option<String>, StoreError> {
        let student_id = student_id.to_string();
        let name = self
            .conn
            .call(move |c| {
                let name = c
                    .query_row(
                        "SELECT display_name FROM students WHERE id = ?1",
                        params![student_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(name)
            })
            .await?;
        Ok(name)
    }

    async fn roster_rows(&self, class_id: &str) -> Result<Vec<RosterEntry>, StoreError> {
        let class_id = class_id.to_string();
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT s.id, s.display_name, s.reference_image, g.vector, g.model_version
                     FROM students s
                     LEFT JOIN signatures g ON g.student_id = s.id
                     WHERE s.class_id = ?1
                     ORDER BY s.id",
                )?;
                let rows = stmt
                    .query_map(params![class_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<Vec<u8>>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, name, image, vector, model_version) in rows {
            let mut entry = RosterEntry::new(id, name);
            if let Some(vector) = vector {
                entry = entry.with_signature(parse_signature(&vector, model_version)?);
            }
            if let Some(image) = image {
                entry = entry.with_reference_image(image);
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn parse_signature(vector: &str, model_version: Option<String>) -> Result<Embedding, StoreError> {
    let values: Vec<f32> = serde_json::from_str(vector).map_err(|e| StoreError::Corrupt {
        table: "signatures",
        reason: e.to_string(),
    })?;
    Ok(Embedding {
        values,
        model_version,
    })
}

#[async_trait]
impl RosterStore for SqliteStore {
    async fn fetch_roster(&self, class_id: &str) -> Result<Vec<RosterEntry>, RosterError> {
        Ok(self.roster_rows(class_id).await?)
    }

    async fn upsert_attendance(
        &self,
        session_id: &str,
        student_id: &str,
        status: AttendanceStatus,
    ) -> Result<(), RosterError> {
        let id = uuid::Uuid::new_v4().to_string();
        let session_id = session_id.to_string();
        let student_id = student_id.to_string();
        let marked_at: DateTime<Utc> = Utc::now();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO attendance (id, session_id, student_id, status, marked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(session_id, student_id) DO UPDATE SET
                        status = excluded.status,
                        marked_at = excluded.marked_at",
                    params![id, session_id, student_id, status.as_str(), marked_at.to_rfc3339()],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn archive_capture(
        &self,
        session: &SessionContext,
        image: &[u8],
        result: &MatchResult,
    ) -> Result<(), RosterError> {
        let id = uuid::Uuid::new_v4().to_string();
        let session_id = session.session_id.clone();
        let student_id = result.student_id.clone().filter(|_| result.matched);
        let matched = result.matched;
        let confidence = result.confidence as f64;
        let image = image.to_vec();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO captures (id, session_id, student_id, matched, confidence, image, captured_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, session_id, student_id, matched, confidence, image, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}
