//! Shared fixtures for engine integration tests: a seeded in-memory gateway
//! and scripted plugins with controllable behavior.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use gradekit_core::domain::{
    Assignment, PluginSelection, Submission, SubmissionStatus, Submitter, Workflow,
};
use gradekit_core::error::{Error, Result};
use gradekit_core::logging::PluginLogger;
use gradekit_core::persist::MemoryGateway;
use gradekit_core::plugin::{
    GradePlugin, GradeResult, GraderFactory, Plugin, PluginKind, PluginMetadata, PluginRegistry,
    SettingsField, SubmissionView, TranscribedSubmission, TranscriberFactory, TranscriptionPlugin,
};

pub const ECHO_TRANSCRIBER: &str = "test.echo-transcriber";
pub const PROBE_TRANSCRIBER: &str = "test.probe-transcriber";
pub const SCRIPTED_GRADER: &str = "test.scripted-grader";
pub const SLOW_GRADER: &str = "test.slow-grader";

fn metadata(id: &str, kind: PluginKind) -> PluginMetadata {
    PluginMetadata {
        id: id.to_string(),
        name: id.to_string(),
        author: "tests".to_string(),
        version: None,
        kind,
    }
}

/// Async transcriber producing a deterministic transcript per submitter
pub struct EchoTranscriber;

impl Plugin for EchoTranscriber {
    fn metadata(&self) -> PluginMetadata {
        metadata(ECHO_TRANSCRIBER, PluginKind::Transcription)
    }
}

#[async_trait]
impl TranscriptionPlugin for EchoTranscriber {
    async fn transcribe(&self, submission: &SubmissionView) -> Result<TranscribedSubmission> {
        // long enough that subscribers attached right after creation see the
        // live stream rather than a finished session
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(TranscribedSubmission {
            transcription: format!("transcript for {}", submission.submitter.name),
            confidence: 0.9,
        })
    }
}

pub struct EchoTranscriberFactory;

impl TranscriberFactory for EchoTranscriberFactory {
    fn metadata(&self) -> PluginMetadata {
        metadata(ECHO_TRANSCRIBER, PluginKind::Transcription)
    }

    fn create(&self, _logger: PluginLogger) -> Result<Box<dyn TranscriptionPlugin>> {
        Ok(Box::new(EchoTranscriber))
    }
}

/// Blocking transcriber that logs two probe lines from the worker thread
pub struct ProbeTranscriber {
    logger: PluginLogger,
}

impl Plugin for ProbeTranscriber {
    fn metadata(&self) -> PluginMetadata {
        metadata(PROBE_TRANSCRIBER, PluginKind::Transcription)
    }
}

#[async_trait]
impl TranscriptionPlugin for ProbeTranscriber {
    fn blocking(&self) -> bool {
        true
    }

    fn transcribe_blocking(&self, submission: &SubmissionView) -> Result<TranscribedSubmission> {
        self.logger.info("P1");
        self.logger.info("P2");
        Ok(TranscribedSubmission {
            transcription: format!("probe transcript for {}", submission.submitter.name),
            confidence: 1.0,
        })
    }
}

pub struct ProbeTranscriberFactory;

impl TranscriberFactory for ProbeTranscriberFactory {
    fn metadata(&self) -> PluginMetadata {
        metadata(PROBE_TRANSCRIBER, PluginKind::Transcription)
    }

    fn create(&self, logger: PluginLogger) -> Result<Box<dyn TranscriptionPlugin>> {
        Ok(Box::new(ProbeTranscriber { logger }))
    }
}

/// Async grader that fails for configured submitter names
pub struct ScriptedGrader {
    fail_for: Vec<String>,
    score: f64,
}

impl Plugin for ScriptedGrader {
    fn metadata(&self) -> PluginMetadata {
        metadata(SCRIPTED_GRADER, PluginKind::Grade)
    }

    fn settings_schema(&self) -> Vec<SettingsField> {
        vec![
            SettingsField::text("fail_for", "Submitters to fail, comma-separated", ""),
            SettingsField::number("score", "Score for every graded submission", 7.5),
        ]
    }

    fn configure(&mut self, values: &Map<String, Value>) -> Result<()> {
        self.fail_for = values
            .get("fail_for")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if let Some(score) = values.get("score").and_then(Value::as_f64) {
            self.score = score;
        }
        Ok(())
    }
}

#[async_trait]
impl GradePlugin for ScriptedGrader {
    async fn grade(
        &self,
        _transcribed: &TranscribedSubmission,
        original: &SubmissionView,
    ) -> Result<GradeResult> {
        if self.fail_for.contains(&original.submitter.name) {
            return Err(Error::PluginRuntime("scripted grader failure".to_string()));
        }
        let mut meta = Map::new();
        meta.insert("grader".to_string(), Value::String("scripted".to_string()));
        Ok(GradeResult {
            score: self.score,
            feedback: format!("feedback for {}", original.submitter.name),
            meta,
        })
    }
}

pub struct ScriptedGraderFactory;

impl GraderFactory for ScriptedGraderFactory {
    fn metadata(&self) -> PluginMetadata {
        metadata(SCRIPTED_GRADER, PluginKind::Grade)
    }

    fn create(&self, _logger: PluginLogger) -> Result<Box<dyn GradePlugin>> {
        Ok(Box::new(ScriptedGrader {
            fail_for: Vec::new(),
            score: 7.5,
        }))
    }
}

/// Async grader that sleeps before answering, for cancellation and timeout tests
pub struct SlowGrader {
    delay: Duration,
}

impl Plugin for SlowGrader {
    fn metadata(&self) -> PluginMetadata {
        metadata(SLOW_GRADER, PluginKind::Grade)
    }

    fn settings_schema(&self) -> Vec<SettingsField> {
        vec![SettingsField::number("delay_ms", "Sleep before grading", 200.0)]
    }

    fn configure(&mut self, values: &Map<String, Value>) -> Result<()> {
        if let Some(delay_ms) = values.get("delay_ms").and_then(Value::as_f64) {
            self.delay = Duration::from_millis(delay_ms as u64);
        }
        Ok(())
    }
}

#[async_trait]
impl GradePlugin for SlowGrader {
    async fn grade(
        &self,
        _transcribed: &TranscribedSubmission,
        _original: &SubmissionView,
    ) -> Result<GradeResult> {
        tokio::time::sleep(self.delay).await;
        Ok(GradeResult {
            score: 5.0,
            feedback: "slow but steady".to_string(),
            meta: Map::new(),
        })
    }
}

pub struct SlowGraderFactory;

impl GraderFactory for SlowGraderFactory {
    fn metadata(&self) -> PluginMetadata {
        metadata(SLOW_GRADER, PluginKind::Grade)
    }

    fn create(&self, _logger: PluginLogger) -> Result<Box<dyn GradePlugin>> {
        Ok(Box::new(SlowGrader {
            delay: Duration::from_millis(200),
        }))
    }
}

/// Registry with every scripted plugin registered
pub fn test_registry() -> Arc<PluginRegistry> {
    let registry = Arc::new(PluginRegistry::new());
    registry
        .register_transcriber(Arc::new(EchoTranscriberFactory))
        .unwrap();
    registry
        .register_transcriber(Arc::new(ProbeTranscriberFactory))
        .unwrap();
    registry
        .register_grader(Arc::new(ScriptedGraderFactory))
        .unwrap();
    registry.register_grader(Arc::new(SlowGraderFactory)).unwrap();
    registry
}

/// Seed `count` submissions (submitter names `student-0`, `student-1`, …)
/// against one assignment with a max grade of 10
pub fn seed_submissions(gateway: &MemoryGateway, count: usize) -> Vec<Uuid> {
    let assignment = Assignment {
        id: Uuid::new_v4(),
        course_id: Uuid::new_v4(),
        title: "Essay".to_string(),
        description: None,
        deadline: None,
        max_grade: Some(serde_json::json!({"value": 10.0})),
    };
    let assignment_id = assignment.id;
    gateway.insert_assignment(assignment);

    let mut ids = Vec::new();
    for i in 0..count {
        let submitter = Submitter {
            id: Uuid::new_v4(),
            name: format!("student-{i}"),
            email: None,
            user_id: None,
            is_synthetic: true,
        };
        let submission = Submission {
            id: Uuid::new_v4(),
            assignment_id,
            submitter_id: submitter.id,
            created_by: Uuid::new_v4(),
            artifact_ids: Vec::new(),
            submitted_at: Some(Utc::now()),
            status: SubmissionStatus::Pending,
            official_run_id: None,
            draft_score: None,
            draft_feedback: None,
            published_score: None,
            published_feedback: None,
            returned_at: None,
        };
        ids.push(submission.id);
        gateway.insert_submitter(submitter);
        gateway.insert_submission(submission);
    }
    ids
}

/// Insert a workflow with the given plugin selections
pub fn seed_workflow(
    gateway: &MemoryGateway,
    transcriber: Option<(&str, Value)>,
    grader: Option<(&str, Value)>,
    validator: Option<(&str, Value)>,
) -> Uuid {
    let selection = |pair: Option<(&str, Value)>| {
        pair.map(|(plugin_id, settings)| PluginSelection {
            plugin_id: plugin_id.to_string(),
            settings: settings.as_object().cloned().unwrap_or_default(),
        })
    };
    let workflow = Workflow {
        id: Uuid::new_v4(),
        course_id: Uuid::new_v4(),
        name: "integration workflow".to_string(),
        created_by: Uuid::new_v4(),
        transcriber: selection(transcriber),
        grader: selection(grader),
        validator: selection(validator),
    };
    let id = workflow.id;
    gateway.insert_workflow(workflow);
    id
}

/// Poll until `predicate` holds or the timeout elapses
pub async fn wait_until<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
