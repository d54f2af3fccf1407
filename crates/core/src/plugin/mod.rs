//! Plugin SDK: contracts between the engine and user-supplied stage code
//!
//! A plugin is one of three kinds — transcription, grade, validation — with
//! declared settings and one operational method per kind. Plugins see only
//! the flat [`SubmissionView`] projection, never the persistence schema.
//!
//! Operational methods come in an async and a blocking flavor. A plugin that
//! does blocking work (file I/O, CPU-bound scoring) returns `true` from
//! `blocking()` and implements the `*_blocking` variant; the engine then
//! runs it on a worker thread. Async plugins implement the async method and
//! are awaited directly. The runner's dispatch helper is the only place that
//! branches on the distinction.

pub mod builtin;
mod registry;
mod settings;

pub use registry::{GraderFactory, PluginRegistry, TranscriberFactory, ValidatorFactory};
pub use settings::{bind_settings, FieldKind, SettingsField};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::SubmissionBundle;
use crate::error::{Error, Result};

/// The three pipeline stages a plugin can implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Transcription,
    Grade,
    Validation,
}

/// Descriptive metadata declared by a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Opaque registry id, conventionally reverse-DNS
    pub id: String,
    pub name: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub kind: PluginKind,
}

/// Flat, read-only projection of a submitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterView {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// Flat, read-only projection of an assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentView {
    pub id: String,
    pub title: String,
    pub description: String,
    /// RFC 3339, empty when no deadline is set
    pub deadline: String,
    pub max_score: f64,
}

/// Flat, read-only projection of an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactView {
    pub title: String,
    pub mime: String,
    pub storage_path: String,
    pub storage_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// The submission as plugins see it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionView {
    pub id: String,
    pub submitter: SubmitterView,
    pub assignment: AssignmentView,
    pub artifacts: Vec<ArtifactView>,
    /// RFC 3339, empty when unset
    pub submitted_at: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl SubmissionView {
    /// Project a loaded bundle into the plugin-facing view
    pub fn from_bundle(bundle: &SubmissionBundle) -> Self {
        let mut meta = Map::new();
        meta.insert(
            "status".to_string(),
            Value::String(bundle.submission.status.as_str().to_string()),
        );

        Self {
            id: bundle.submission.id.to_string(),
            submitter: SubmitterView {
                id: bundle.submitter.id.to_string(),
                name: bundle.submitter.name.clone(),
                email: bundle.submitter.email.clone().unwrap_or_default(),
            },
            assignment: AssignmentView {
                id: bundle.assignment.id.to_string(),
                title: bundle.assignment.title.clone(),
                description: bundle.assignment.description.clone().unwrap_or_default(),
                deadline: bundle
                    .assignment
                    .deadline
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default(),
                max_score: bundle.assignment.max_score(),
            },
            artifacts: bundle
                .artifacts
                .iter()
                .map(|a| ArtifactView {
                    title: a.title.clone(),
                    mime: a.mime.clone(),
                    storage_path: a.storage_path.clone(),
                    storage_kind: a.storage_kind.clone(),
                    meta: a.meta.clone(),
                })
                .collect(),
            submitted_at: bundle
                .submission
                .submitted_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            meta,
        }
    }
}

/// Output of the transcription stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribedSubmission {
    pub transcription: String,
    pub confidence: f64,
}

/// Output of the grading stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeResult {
    pub score: f64,
    pub feedback: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// Behavior shared by every plugin kind
pub trait Plugin: Send + Sync {
    /// Descriptive metadata
    fn metadata(&self) -> PluginMetadata;

    /// Declarative settings schema; empty means the plugin takes no settings
    fn settings_schema(&self) -> Vec<SettingsField> {
        Vec::new()
    }

    /// Apply validated settings values
    ///
    /// Called once after [`bind_settings`] succeeded; `values` contains every
    /// declared field, with defaults filled in.
    fn configure(&mut self, values: &Map<String, Value>) -> Result<()> {
        let _ = values;
        Ok(())
    }
}

/// Transcription stage contract
#[async_trait]
pub trait TranscriptionPlugin: Plugin {
    /// Whether the engine should run this plugin on a worker thread
    fn blocking(&self) -> bool {
        false
    }

    /// Transcribe one submission
    async fn transcribe(&self, submission: &SubmissionView) -> Result<TranscribedSubmission> {
        self.transcribe_blocking(submission)
    }

    /// Blocking variant, run on a worker thread when `blocking()` is true
    fn transcribe_blocking(&self, submission: &SubmissionView) -> Result<TranscribedSubmission> {
        let _ = submission;
        Err(Error::PluginRuntime(
            "blocking transcription not implemented".to_string(),
        ))
    }

    /// Transcribe a batch; the default delegates to `transcribe` per item
    async fn transcribe_batch(
        &self,
        submissions: &[SubmissionView],
    ) -> Result<Vec<TranscribedSubmission>> {
        let mut results = Vec::with_capacity(submissions.len());
        for submission in submissions {
            results.push(self.transcribe(submission).await?);
        }
        Ok(results)
    }
}

impl fmt::Debug for dyn TranscriptionPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.metadata().fmt(f)
    }
}

/// Grading stage contract
#[async_trait]
pub trait GradePlugin: Plugin {
    /// Whether the engine should run this plugin on a worker thread
    fn blocking(&self) -> bool {
        false
    }

    /// Grade one transcribed submission
    async fn grade(
        &self,
        transcribed: &TranscribedSubmission,
        original: &SubmissionView,
    ) -> Result<GradeResult> {
        self.grade_blocking(transcribed, original)
    }

    /// Blocking variant, run on a worker thread when `blocking()` is true
    fn grade_blocking(
        &self,
        transcribed: &TranscribedSubmission,
        original: &SubmissionView,
    ) -> Result<GradeResult> {
        let _ = (transcribed, original);
        Err(Error::PluginRuntime(
            "blocking grading not implemented".to_string(),
        ))
    }
}

impl fmt::Debug for dyn GradePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.metadata().fmt(f)
    }
}

/// Validation stage contract
///
/// Validation is post-processing: it never overwrites grading fields, it may
/// only annotate grading metadata.
#[async_trait]
pub trait ValidationPlugin: Plugin {
    /// Whether the engine should run this plugin on a worker thread
    fn blocking(&self) -> bool {
        false
    }

    /// Judge one grade result
    async fn validate_one(&self, grade: &GradeResult) -> Result<bool> {
        self.validate_one_blocking(grade)
    }

    /// Blocking variant, run on a worker thread when `blocking()` is true
    fn validate_one_blocking(&self, grade: &GradeResult) -> Result<bool> {
        let _ = grade;
        Err(Error::PluginRuntime(
            "blocking validation not implemented".to_string(),
        ))
    }

    /// Judge a batch; the default delegates to `validate_one` per item
    async fn validate_batch(&self, grades: &[GradeResult]) -> Result<Vec<bool>> {
        let mut results = Vec::with_capacity(grades.len());
        for grade in grades {
            results.push(self.validate_one(grade).await?);
        }
        Ok(results)
    }
}
