//! Attendance write-back: turns a recognition result into a stored record
//! and the response shown to the proctor.

use crate::roster::RosterStore;
use crate::types::{AttendanceStatus, MatchResult, RejectionReason, SessionContext};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    pub confidence: f32,
    pub status: AttendanceStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AttendanceOutcome {
    fn absent(result: &MatchResult, message: String) -> Self {
        Self {
            success: false,
            student_id: result.student_id.clone(),
            student_name: result.student_name.clone(),
            confidence: result.confidence,
            status: AttendanceStatus::Absent,
            message,
            timestamp: Utc::now(),
        }
    }
}

/// User guidance for a rejected capture.
pub fn guidance(reason: RejectionReason, session: &SessionContext) -> String {
    match reason {
        RejectionReason::NoFaceDetected => {
            "No face detected. Move closer to the camera and retake the photo".to_string()
        }
        RejectionReason::LowConfidence => {
            "No confident match among class students. Retake the photo facing the camera".to_string()
        }
        RejectionReason::NoCandidates => format!(
            "No students with a reference photo found in class '{}'",
            session.class_id
        ),
    }
}

pub struct AttendanceRecorder {
    store: Arc<dyn RosterStore>,
    archive_captures: bool,
}

impl AttendanceRecorder {
    pub fn new(store: Arc<dyn RosterStore>, archive_captures: bool) -> Self {
        Self {
            store,
            archive_captures,
        }
    }

    /// Persist the outcome of one recognition call.
    ///
    /// Only matches are written; the upsert is keyed by (session, student) so
    /// a repeated capture of the same student keeps a single record.
    pub async fn record(
        &self,
        session: &SessionContext,
        image: &[u8],
        result: &MatchResult,
    ) -> AttendanceOutcome {
        if self.archive_captures {
            if let Err(err) = self.store.archive_capture(session, image, result).await {
                tracing::warn!(session_id = %session.session_id, error = %err, "capture archive failed");
            }
        }

        let (student_id, student_name) = match (&result.student_id, result.matched) {
            (Some(id), true) => (id, result.student_name.as_deref().unwrap_or(id)),
            _ => {
                let reason = result.reason.unwrap_or(RejectionReason::LowConfidence);
                return AttendanceOutcome::absent(result, guidance(reason, session));
            }
        };

        match self
            .store
            .upsert_attendance(&session.session_id, student_id, AttendanceStatus::Present)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    session_id = %session.session_id,
                    student_id = %student_id,
                    confidence = result.confidence,
                    "marked present"
                );
                AttendanceOutcome {
                    success: true,
                    student_id: Some(student_id.clone()),
                    student_name: Some(student_name.to_string()),
                    confidence: result.confidence,
                    status: AttendanceStatus::Present,
                    message: format!("Attendance marked successfully for {student_name}"),
                    timestamp: Utc::now(),
                }
            }
            Err(err) => {
                tracing::error!(
                    session_id = %session.session_id,
                    student_id = %student_id,
                    error = %err,
                    "attendance upsert failed"
                );
                AttendanceOutcome::absent(result, "Failed to update attendance in database".into())
            }
        }
    }
}
