use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Distance window inside which two roster members count as tied.
pub const TIE_EPSILON: f32 = 1e-6;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face signature vector (512-dimensional for ArcFace, any length in tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero vector on either side has similarity 0. Signatures of different
    /// lengths, or with non-finite components, are not comparable.
    pub fn similarity(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if !(dot.is_finite() && denom.is_finite()) {
            return None;
        }
        if denom > 0.0 {
            Some((dot / denom).clamp(-1.0, 1.0))
        } else {
            Some(0.0)
        }
    }

    /// Cosine distance in [0, 2]: 0 = identical direction.
    pub fn cosine_distance(&self, other: &Embedding) -> Option<f32> {
        self.similarity(other).map(|s| 1.0 - s)
    }
}

/// Map a cosine distance onto the [0, 1] confidence scale.
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("date is not ISO-8601: {0}")]
    InvalidDate(String),
}

/// Classroom session a capture token or recognition call is bound to.
///
/// Construct through [`SessionContext::new`], which applies the ingestion
/// normalization rules once: surrounding whitespace is trimmed, the class
/// identifier is case-folded, blank optional fields become `None`, and the
/// date must parse as an ISO-8601 date or date-time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub display_name: String,
    pub class_id: String,
    pub date: Option<NaiveDate>,
    pub professor: Option<String>,
    pub roster_version: Option<String>,
}

impl SessionContext {
    pub fn new(
        session_id: &str,
        display_name: &str,
        class_id: &str,
        date: Option<&str>,
        professor: Option<&str>,
    ) -> Result<Self, ContextError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(ContextError::MissingField("id"));
        }
        let class_id = normalize_class_id(class_id);
        if class_id.is_empty() {
            return Err(ContextError::MissingField("classe"));
        }
        let date = match non_blank(date) {
            Some(raw) => Some(parse_iso_date(&raw)?),
            None => None,
        };

        Ok(Self {
            session_id: session_id.to_string(),
            display_name: display_name.trim().to_string(),
            class_id,
            date,
            professor: non_blank(professor),
            roster_version: None,
        })
    }

    pub fn with_roster_version(mut self, version: impl Into<String>) -> Self {
        self.roster_version = Some(version.into());
        self
    }
}

/// Class identifiers compare case-insensitively and ignore padding.
pub fn normalize_class_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_iso_date(raw: &str) -> Result<NaiveDate, ContextError> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.date_naive());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|dt| dt.date())
        .map_err(|_| ContextError::InvalidDate(raw.to_string()))
}

/// One student eligible for a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub student_id: String,
    pub display_name: String,
    /// Signature computed ahead of time; skips extraction entirely.
    pub signature: Option<Embedding>,
    /// Encoded reference photo the signature is extracted from on demand.
    #[serde(skip)]
    pub reference_image: Option<Arc<Vec<u8>>>,
}

impl RosterEntry {
    pub fn new(student_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into().trim().to_string(),
            display_name: display_name.into().trim().to_string(),
            signature: None,
            reference_image: None,
        }
    }

    pub fn with_signature(mut self, signature: Embedding) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_reference_image(mut self, image: Vec<u8>) -> Self {
        self.reference_image = Some(Arc::new(image));
        self
    }

    /// Whether this entry can ever yield a signature.
    pub fn is_matchable(&self) -> bool {
        self.signature.is_some() || self.reference_image.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            _ => None,
        }
    }
}

/// Why a recognition call did not produce a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NoFaceDetected,
    LowConfidence,
    /// The roster had no member with a usable signature.
    NoCandidates,
}

/// Outcome of one recognition call. Non-matches are ordinary values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    pub student_id: Option<String>,
    pub student_name: Option<String>,
    /// Always in [0, 1].
    pub confidence: f32,
    /// Cosine distance of the best candidate, when there was one.
    pub distance: Option<f32>,
    pub reason: Option<RejectionReason>,
}

impl MatchResult {
    pub fn rejected(reason: RejectionReason) -> Self {
        Self {
            matched: false,
            student_id: None,
            student_name: None,
            confidence: 0.0,
            distance: None,
            reason: Some(reason),
        }
    }
}

/// A roster member with a resolved signature, ready for comparison.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub student_id: String,
    pub display_name: String,
    pub signature: Arc<Embedding>,
}

/// Strategy for comparing a probe signature against a roster gallery.
pub trait Matcher {
    /// `threshold` is the largest accepted distance on the matcher's native scale.
    fn compare(&self, probe: &Embedding, gallery: &[Candidate], threshold: f32) -> MatchResult;
}

/// Cosine-distance matcher with deterministic tie-breaking.
///
/// Members within [`TIE_EPSILON`] of the best distance resolve to the
/// lexicographically smallest student id.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Candidate], threshold: f32) -> MatchResult {
        let scored: Vec<(f32, &Candidate)> = gallery
            .iter()
            .filter_map(|c| match probe.cosine_distance(&c.signature) {
                Some(distance) => Some((distance, c)),
                None => {
                    tracing::warn!(
                        student_id = %c.student_id,
                        probe_len = probe.values.len(),
                        signature_len = c.signature.values.len(),
                        model_version = ?c.signature.model_version,
                        "signature not comparable with probe; skipping"
                    );
                    None
                }
            })
            .collect();

        let Some(best_distance) = scored
            .iter()
            .map(|(d, _)| *d)
            .min_by(|a, b| a.total_cmp(b))
        else {
            return MatchResult::rejected(RejectionReason::NoCandidates);
        };

        let mut tied: Vec<&Candidate> = scored
            .iter()
            .filter(|(d, _)| *d - best_distance <= TIE_EPSILON)
            .map(|(_, c)| *c)
            .collect();
        tied.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        let Some(&best) = tied.first() else {
            return MatchResult::rejected(RejectionReason::NoCandidates);
        };

        if tied.len() > 1 {
            tracing::warn!(
                distance = best_distance,
                candidates = ?tied.iter().map(|c| c.student_id.as_str()).collect::<Vec<_>>(),
                chosen = %best.student_id,
                "ambiguous best match; using smallest student id"
            );
        }

        let confidence = confidence_from_distance(best_distance);
        if best_distance <= threshold {
            MatchResult {
                matched: true,
                student_id: Some(best.student_id.clone()),
                student_name: Some(best.display_name.clone()),
                confidence,
                distance: Some(best_distance),
                reason: None,
            }
        } else {
            MatchResult {
                matched: false,
                student_id: None,
                student_name: None,
                confidence,
                distance: Some(best_distance),
                reason: Some(RejectionReason::LowConfidence),
            }
        }
    }
}
