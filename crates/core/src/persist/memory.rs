//! In-memory persistence gateway
//!
//! Backs tests and embedded deployments. Tables are plain maps behind one
//! `RwLock`; every trait method takes the lock once, so each call is atomic
//! with respect to the others.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::{
    Artifact, Assignment, Submission, SubmissionBundle, SubmissionEvent, SubmissionResult,
    Submitter, Workflow, WorkflowRun,
};
use crate::error::{Error, Result};
use crate::events::Envelope;

use super::{PersistenceGateway, ResultPatch, RunPatch, SubmissionPatch};

#[derive(Default)]
struct Tables {
    submitters: HashMap<Uuid, Submitter>,
    assignments: HashMap<Uuid, Assignment>,
    artifacts: HashMap<Uuid, Artifact>,
    submissions: HashMap<Uuid, Submission>,
    workflows: HashMap<Uuid, Workflow>,
    runs: HashMap<Uuid, WorkflowRun>,
    results: HashMap<(Uuid, Uuid), SubmissionResult>,
    events: Vec<SubmissionEvent>,
}

/// Map-backed gateway implementation
#[derive(Default)]
pub struct MemoryGateway {
    tables: RwLock<Tables>,
}

impl MemoryGateway {
    /// Create an empty gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a submitter row
    pub fn insert_submitter(&self, submitter: Submitter) {
        self.tables.write().submitters.insert(submitter.id, submitter);
    }

    /// Seed an assignment row
    pub fn insert_assignment(&self, assignment: Assignment) {
        self.tables.write().assignments.insert(assignment.id, assignment);
    }

    /// Seed an artifact row
    pub fn insert_artifact(&self, artifact: Artifact) {
        self.tables.write().artifacts.insert(artifact.id, artifact);
    }

    /// Seed a submission row
    pub fn insert_submission(&self, submission: Submission) {
        self.tables.write().submissions.insert(submission.id, submission);
    }

    /// Seed a workflow row
    pub fn insert_workflow(&self, workflow: Workflow) {
        self.tables.write().workflows.insert(workflow.id, workflow);
    }

    /// Current submission row, if any
    pub fn submission(&self, id: Uuid) -> Option<Submission> {
        self.tables.read().submissions.get(&id).cloned()
    }

    /// Current run row, if any
    pub fn run(&self, id: Uuid) -> Option<WorkflowRun> {
        self.tables.read().runs.get(&id).cloned()
    }

    /// Current result record, if any
    pub fn result(&self, submission_id: Uuid, run_id: Uuid) -> Option<SubmissionResult> {
        self.tables
            .read()
            .results
            .get(&(submission_id, run_id))
            .cloned()
    }

    /// Audit entries recorded for a submission, in insertion order
    pub fn events_for(&self, submission_id: Uuid) -> Vec<SubmissionEvent> {
        self.tables
            .read()
            .events
            .iter()
            .filter(|e| e.submission_id == submission_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn load_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        Ok(self.tables.read().workflows.get(&id).cloned())
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self.tables.read().runs.get(&id).cloned())
    }

    async fn load_submissions(&self, ids: &[Uuid]) -> Result<Vec<SubmissionBundle>> {
        let tables = self.tables.read();
        let mut bundles = Vec::new();
        for id in ids {
            let Some(submission) = tables.submissions.get(id) else {
                continue;
            };
            let submitter = tables
                .submitters
                .get(&submission.submitter_id)
                .cloned()
                .ok_or_else(|| {
                    Error::Persistence(format!("submitter {} missing", submission.submitter_id))
                })?;
            let assignment = tables
                .assignments
                .get(&submission.assignment_id)
                .cloned()
                .ok_or_else(|| {
                    Error::Persistence(format!("assignment {} missing", submission.assignment_id))
                })?;
            let artifacts = submission
                .artifact_ids
                .iter()
                .filter_map(|aid| tables.artifacts.get(aid).cloned())
                .collect();
            bundles.push(SubmissionBundle {
                submission: submission.clone(),
                submitter,
                assignment,
                artifacts,
            });
        }
        Ok(bundles)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.runs.contains_key(&run.id) {
            return Err(Error::Persistence(format!("run {} already exists", run.id)));
        }
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run_id: Uuid, patch: &RunPatch) -> Result<()> {
        let mut tables = self.tables.write();
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::Persistence(format!("run {run_id} not found")))?;
        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            run.finished_at = Some(finished_at);
        }
        Ok(())
    }

    async fn update_submissions(&self, ids: &[Uuid], patch: &SubmissionPatch) -> Result<()> {
        let mut tables = self.tables.write();
        for id in ids {
            let Some(submission) = tables.submissions.get_mut(id) else {
                continue;
            };
            if let Some(status) = patch.status {
                submission.status = status;
            }
            if let Some(run_id) = patch.official_run_id {
                submission.official_run_id = Some(run_id);
            }
            if let Some(score) = patch.draft_score {
                submission.draft_score = Some(score);
            }
            if let Some(feedback) = &patch.draft_feedback {
                submission.draft_feedback = Some(feedback.clone());
            }
        }
        Ok(())
    }

    async fn upsert_submission_result(
        &self,
        submission_id: Uuid,
        run_id: Uuid,
        patch: &ResultPatch,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let result = tables
            .results
            .entry((submission_id, run_id))
            .or_insert_with(|| SubmissionResult::new(submission_id, run_id));
        if let Some(transcription) = &patch.transcription {
            result.transcription = Some(transcription.clone());
        }
        if let Some(confidence) = patch.transcription_confidence {
            result.transcription_confidence = Some(confidence);
        }
        if let Some(at) = patch.transcribed_at {
            result.transcribed_at = Some(at);
        }
        if let Some(score) = patch.score {
            result.score = Some(score);
        }
        if let Some(feedback) = &patch.feedback {
            result.feedback = Some(feedback.clone());
        }
        if let Some(meta) = &patch.grading_meta {
            result.grading_meta = Some(meta.clone());
        }
        if let Some(at) = patch.graded_at {
            result.graded_at = Some(at);
        }
        Ok(())
    }

    async fn append_run_log(&self, run_id: Uuid, entry: &Envelope) -> Result<()> {
        let mut tables = self.tables.write();
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::Persistence(format!("run {run_id} not found")))?;
        run.logs.history.push(entry.clone());
        Ok(())
    }

    async fn record_submission_event(&self, event: &SubmissionEvent) -> Result<()> {
        self.tables.write().events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunStatus, SubmissionStatus};
    use chrono::Utc;

    fn submission(id: Uuid, submitter_id: Uuid, assignment_id: Uuid) -> Submission {
        Submission {
            id,
            assignment_id,
            submitter_id,
            created_by: Uuid::new_v4(),
            artifact_ids: Vec::new(),
            submitted_at: None,
            status: SubmissionStatus::Pending,
            official_run_id: None,
            draft_score: None,
            draft_feedback: None,
            published_score: None,
            published_feedback: None,
            returned_at: None,
        }
    }

    fn seed(gateway: &MemoryGateway) -> Uuid {
        let submitter = Submitter {
            id: Uuid::new_v4(),
            name: "Ada".to_string(),
            email: None,
            user_id: None,
            is_synthetic: false,
        };
        let assignment = Assignment {
            id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            title: "Essay".to_string(),
            description: None,
            deadline: None,
            max_grade: None,
        };
        let sub = submission(Uuid::new_v4(), submitter.id, assignment.id);
        let sub_id = sub.id;
        gateway.insert_submitter(submitter);
        gateway.insert_assignment(assignment);
        gateway.insert_submission(sub);
        sub_id
    }

    #[tokio::test]
    async fn test_load_submissions_skips_unknown_ids() {
        let gateway = MemoryGateway::new();
        let known = seed(&gateway);
        let bundles = gateway
            .load_submissions(&[Uuid::new_v4(), known])
            .await
            .unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].submission.id, known);
    }

    #[tokio::test]
    async fn test_update_run_partial() {
        let gateway = MemoryGateway::new();
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            run_by: Uuid::new_v4(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            logs: Default::default(),
            submission_ids: Vec::new(),
        };
        gateway.create_run(&run).await.unwrap();

        let started = Utc::now();
        gateway
            .update_run(
                run.id,
                &RunPatch::status(RunStatus::Running).with_started_at(started),
            )
            .await
            .unwrap();

        let loaded = gateway.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.started_at, Some(started));
        assert_eq!(loaded.finished_at, None);

        // applying the same patch twice converges on the same row
        gateway
            .update_run(
                run.id,
                &RunPatch::status(RunStatus::Running).with_started_at(started),
            )
            .await
            .unwrap();
        let again = gateway.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(again.status, loaded.status);
        assert_eq!(again.started_at, loaded.started_at);
    }

    #[tokio::test]
    async fn test_upsert_result_is_cumulative() {
        let gateway = MemoryGateway::new();
        let sub = Uuid::new_v4();
        let run = Uuid::new_v4();
        let now = Utc::now();

        gateway
            .upsert_submission_result(sub, run, &ResultPatch::transcription("text", 0.9, now))
            .await
            .unwrap();
        gateway
            .upsert_submission_result(
                sub,
                run,
                &ResultPatch::grade(7.5, "good", serde_json::json!({}), now),
            )
            .await
            .unwrap();

        let result = gateway.result(sub, run).unwrap();
        assert_eq!(result.transcription.as_deref(), Some("text"));
        assert_eq!(result.transcription_confidence, Some(0.9));
        assert_eq!(result.score, Some(7.5));
        assert_eq!(result.feedback.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_upsert_last_writer_wins_per_field() {
        let gateway = MemoryGateway::new();
        let sub = Uuid::new_v4();
        let run = Uuid::new_v4();
        let now = Utc::now();

        gateway
            .upsert_submission_result(sub, run, &ResultPatch::grade(5.0, "first", serde_json::json!({}), now))
            .await
            .unwrap();
        gateway
            .upsert_submission_result(sub, run, &ResultPatch::grade(6.0, "second", serde_json::json!({}), now))
            .await
            .unwrap();

        let result = gateway.result(sub, run).unwrap();
        assert_eq!(result.score, Some(6.0));
        assert_eq!(result.feedback.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_draft_fields_updated() {
        let gateway = MemoryGateway::new();
        let sub_id = seed(&gateway);
        gateway
            .update_submissions(&[sub_id], &SubmissionPatch::draft(9.0, "well argued"))
            .await
            .unwrap();

        let sub = gateway.submission(sub_id).unwrap();
        assert_eq!(sub.draft_score, Some(9.0));
        assert_eq!(sub.draft_feedback.as_deref(), Some("well argued"));
        // status untouched
        assert_eq!(sub.status, SubmissionStatus::Pending);
    }

    #[tokio::test]
    async fn test_append_run_log_unknown_run_errors() {
        let gateway = MemoryGateway::new();
        let err = gateway
            .append_run_log(Uuid::new_v4(), &Envelope::close("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }
}
