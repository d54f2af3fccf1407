//! Persistence gateway
//!
//! The runner never touches storage directly; it goes through the
//! [`PersistenceGateway`] trait with value-type DTOs at the boundary. Each
//! operation is transactional on its own — the engine never holds a storage
//! transaction across an await point. Partial updates travel as patch
//! structs whose `None` fields are left untouched.

mod memory;
mod sqlite;

pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    RunStatus, SubmissionBundle, SubmissionEvent, SubmissionStatus, Workflow, WorkflowRun,
};
use crate::error::Result;
use crate::events::Envelope;

/// Partial update for a workflow run
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunPatch {
    /// Patch setting only the status
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Also set `started_at`
    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Also set `finished_at`
    pub fn with_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }
}

/// Partial update for a set of submissions
#[derive(Debug, Clone, Default)]
pub struct SubmissionPatch {
    pub status: Option<SubmissionStatus>,
    pub official_run_id: Option<Uuid>,
    pub draft_score: Option<f64>,
    pub draft_feedback: Option<String>,
}

impl SubmissionPatch {
    /// Patch setting only the status
    pub fn status(status: SubmissionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Also set the official run pointer
    pub fn with_official_run(mut self, run_id: Uuid) -> Self {
        self.official_run_id = Some(run_id);
        self
    }

    /// Patch setting the draft grading fields
    pub fn draft(score: f64, feedback: impl Into<String>) -> Self {
        Self {
            draft_score: Some(score),
            draft_feedback: Some(feedback.into()),
            ..Self::default()
        }
    }
}

/// Partial update for a per-(submission, run) result record
///
/// Upserts are cumulative: fields set by an earlier stage survive later
/// stage writes; a field present in both takes the later value.
#[derive(Debug, Clone, Default)]
pub struct ResultPatch {
    pub transcription: Option<String>,
    pub transcription_confidence: Option<f64>,
    pub transcribed_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    pub feedback: Option<String>,
    pub grading_meta: Option<Value>,
    pub graded_at: Option<DateTime<Utc>>,
}

impl ResultPatch {
    /// Transcription-stage fields
    pub fn transcription(
        transcription: impl Into<String>,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            transcription: Some(transcription.into()),
            transcription_confidence: Some(confidence),
            transcribed_at: Some(at),
            ..Self::default()
        }
    }

    /// Grading-stage fields
    pub fn grade(score: f64, feedback: impl Into<String>, meta: Value, at: DateTime<Utc>) -> Self {
        Self {
            score: Some(score),
            feedback: Some(feedback.into()),
            grading_meta: Some(meta),
            graded_at: Some(at),
            ..Self::default()
        }
    }

    /// Metadata-only annotation, used by the validation stage
    pub fn meta(meta: Value) -> Self {
        Self {
            grading_meta: Some(meta),
            ..Self::default()
        }
    }
}

/// Storage operations the engine needs; all transactional per call
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Load a workflow by id
    async fn load_workflow(&self, id: Uuid) -> Result<Option<Workflow>>;

    /// Load a run by id, including logs and linked submission ids
    async fn load_run(&self, id: Uuid) -> Result<Option<WorkflowRun>>;

    /// Load submissions with submitter, assignment, and artifacts
    ///
    /// Unknown ids are skipped; the result preserves the input order of the
    /// ids that resolved.
    async fn load_submissions(&self, ids: &[Uuid]) -> Result<Vec<SubmissionBundle>>;

    /// Insert a new run row with its submission links
    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;

    /// Apply a partial update to a run; idempotent
    async fn update_run(&self, run_id: Uuid, patch: &RunPatch) -> Result<()>;

    /// Apply a partial update to every listed submission that exists
    async fn update_submissions(&self, ids: &[Uuid], patch: &SubmissionPatch) -> Result<()>;

    /// Create-or-merge the result record keyed on (submission, run)
    async fn upsert_submission_result(
        &self,
        submission_id: Uuid,
        run_id: Uuid,
        patch: &ResultPatch,
    ) -> Result<()>;

    /// Append one envelope to the run's log history
    async fn append_run_log(&self, run_id: Uuid, entry: &Envelope) -> Result<()>;

    /// Record an audit entry on a submission
    async fn record_submission_event(&self, event: &SubmissionEvent) -> Result<()>;
}
