//! Engine-owned domain value types
//!
//! These are plain DTOs exchanged with the persistence gateway. The engine
//! never holds a storage handle; every struct here is an owned snapshot that
//! is safe to keep across await points.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::events::Envelope;

/// Platform role of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Professor,
    Student,
}

/// Platform identity; immutable to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// The party whose work is being graded
///
/// Distinct from [`User`]: the engine also grades synthetic submitters
/// (research or test data) that have no platform account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submitter {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub is_synthetic: bool,
}

/// Assignment the submissions belong to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Structured maximum grade, e.g. `{"value": 100.0}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_grade: Option<Value>,
}

impl Assignment {
    /// Numeric maximum score, defaulting to 0.0 when absent or non-numeric
    pub fn max_score(&self) -> f64 {
        self.max_grade
            .as_ref()
            .and_then(|g| g.get("value"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }
}

/// Artifact lifecycle state, managed by the external orphan sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Attached,
    Orphaned,
    Archived,
    Deleted,
}

/// Visibility scope of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Private,
    Course,
    Assignment,
    Public,
}

/// Addressable content blob; the engine only reads these
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub title: String,
    pub mime: String,
    pub storage_path: String,
    pub storage_kind: String,
    pub status: ArtifactStatus,
    pub access_level: AccessLevel,
    pub creator_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-run submission state machine
///
/// `pending → processing → transcribing → transcribed → grading → graded`,
/// with `failure` reachable from any non-terminal state and `returned`
/// applied outside the engine after publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Processing,
    Transcribing,
    Transcribed,
    Grading,
    Graded,
    Returned,
    Failure,
}

impl SubmissionStatus {
    /// States the runner never moves a submission out of
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Graded | Self::Returned | Self::Failure)
    }

    /// Wire/database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Transcribing => "transcribing",
            Self::Transcribed => "transcribed",
            Self::Grading => "grading",
            Self::Graded => "graded",
            Self::Returned => "returned",
            Self::Failure => "failure",
        }
    }

    /// Parse the wire/database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "transcribing" => Some(Self::Transcribing),
            "transcribed" => Some(Self::Transcribed),
            "grading" => Some(Self::Grading),
            "graded" => Some(Self::Graded),
            "returned" => Some(Self::Returned),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// A student submission row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub submitter_id: Uuid,
    pub created_by: Uuid,
    /// Ordered artifact set
    #[serde(default)]
    pub artifact_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub official_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
}

/// One plugin slot of a workflow: an opaque registry id plus bound settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSelection {
    pub plugin_id: String,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Saved pipeline configuration for a course
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub course_id: Uuid,
    pub name: String,
    pub created_by: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcriber: Option<PluginSelection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grader: Option<PluginSelection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator: Option<PluginSelection>,
}

/// Workflow run lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl RunStatus {
    /// A run is terminal iff it reached success or failure
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Whether the state machine admits the transition
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failure)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failure)
        )
    }

    /// Wire/database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Parse the wire/database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Structured log history persisted on the run row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLogs {
    #[serde(default)]
    pub history: Vec<Envelope>,
}

/// One execution of a workflow over a chosen submission set
///
/// The `id` doubles as the session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub run_by: Uuid,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: RunLogs,
    #[serde(default)]
    pub submission_ids: Vec<Uuid>,
}

/// Per-(submission, run) result record, upserted stage by stage
///
/// Fields are cumulative: a later stage's upsert never clears an earlier
/// stage's fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub submission_id: Uuid,
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcribed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grading_meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graded_at: Option<DateTime<Utc>>,
}

impl SubmissionResult {
    /// Empty record for a (submission, run) pair
    pub fn new(submission_id: Uuid, run_id: Uuid) -> Self {
        Self {
            submission_id,
            run_id,
            transcription: None,
            transcription_confidence: None,
            transcribed_at: None,
            score: None,
            feedback: None,
            grading_meta: None,
            graded_at: None,
        }
    }
}

/// Kind of an audit entry on a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionEventType {
    AiGraded,
    ManualEdit,
    Returned,
    StatusChanged,
}

impl SubmissionEventType {
    /// Wire/database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiGraded => "ai_graded",
            Self::ManualEdit => "manual_edit",
            Self::Returned => "returned",
            Self::StatusChanged => "status_changed",
        }
    }

    /// Parse the wire/database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ai_graded" => Some(Self::AiGraded),
            "manual_edit" => Some(Self::ManualEdit),
            "returned" => Some(Self::Returned),
            "status_changed" => Some(Self::StatusChanged),
            _ => None,
        }
    }
}

/// Append-only audit entry on a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionEvent {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub event_type: SubmissionEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Loaded read-model for one submission: the row plus everything the
/// plugin-facing view needs
#[derive(Debug, Clone)]
pub struct SubmissionBundle {
    pub submission: Submission,
    pub submitter: Submitter,
    pub assignment: Assignment,
    /// In the submission's declared artifact order
    pub artifacts: Vec<Artifact>,
}

/// Summary of one submission inside a [`RunView`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSummary {
    pub id: Uuid,
    pub submitter_id: Uuid,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub official_run_id: Option<Uuid>,
}

/// View of a run returned from session creation and lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub run_by: Uuid,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: RunLogs,
    pub submissions: Vec<SubmissionSummary>,
}

impl RunView {
    /// Project a run plus its loaded submissions into the response view
    pub fn from_run(run: &WorkflowRun, bundles: &[SubmissionBundle]) -> Self {
        Self {
            id: run.id,
            workflow_id: run.workflow_id,
            run_by: run.run_by,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            logs: run.logs.clone(),
            submissions: bundles
                .iter()
                .map(|b| SubmissionSummary {
                    id: b.submission.id,
                    submitter_id: b.submission.submitter_id,
                    status: b.submission.status,
                    official_run_id: b.submission.official_run_id,
                })
                .collect(),
        }
    }
}
