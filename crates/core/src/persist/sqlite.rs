//! SQLite-backed persistence gateway
//!
//! Uuids are stored as TEXT, timestamps as RFC 3339 TEXT, structured values
//! as JSON TEXT. The connection sits behind an async mutex; every trait
//! method takes the lock, runs one transaction, and releases it before the
//! caller can await anything else.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    AccessLevel, Artifact, ArtifactStatus, Assignment, PluginSelection, RunLogs, RunStatus,
    Submission, SubmissionBundle, SubmissionEvent, SubmissionEventType, SubmissionResult,
    SubmissionStatus, Submitter, Workflow, WorkflowRun,
};
use crate::error::{Error, Result};
use crate::events::Envelope;

use super::{PersistenceGateway, ResultPatch, RunPatch, SubmissionPatch};

/// Gateway over a single SQLite connection
pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

impl SqliteGateway {
    /// Open (or create) a database file and initialize the schema
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Persistence(format!("failed to open database: {e}")))?;
        Self::with_connection(conn)
    }

    /// Fully in-memory database, used by tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Persistence(format!("failed to open database: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)
            .map_err(|e| Error::Persistence(format!("failed to initialize schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Seed a submitter row
    pub async fn insert_submitter(&self, submitter: &Submitter) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO submitters (id, name, email, user_id, is_synthetic)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                submitter.id.to_string(),
                submitter.name,
                submitter.email,
                submitter.user_id.map(|u| u.to_string()),
                submitter.is_synthetic,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Seed an assignment row
    pub async fn insert_assignment(&self, assignment: &Assignment) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO assignments (id, course_id, title, description, deadline, max_grade)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                assignment.id.to_string(),
                assignment.course_id.to_string(),
                assignment.title,
                assignment.description,
                assignment.deadline.map(|d| d.to_rfc3339()),
                assignment.max_grade.as_ref().map(Value::to_string),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Seed an artifact row
    pub async fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO artifacts (id, title, mime, storage_path, storage_kind, status,
                                    access_level, creator_id, course_id, assignment_id, meta,
                                    created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                artifact.id.to_string(),
                artifact.title,
                artifact.mime,
                artifact.storage_path,
                artifact.storage_kind,
                status_str(artifact.status),
                access_str(artifact.access_level),
                artifact.creator_id.to_string(),
                artifact.course_id.map(|u| u.to_string()),
                artifact.assignment_id.map(|u| u.to_string()),
                artifact.meta.as_ref().map(Value::to_string),
                artifact.created_at.to_rfc3339(),
                artifact.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Seed a submission row with its artifact links
    pub async fn insert_submission(&self, submission: &Submission) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO submissions (id, assignment_id, submitter_id, created_by, submitted_at,
                                      status, official_run_id, draft_score, draft_feedback,
                                      published_score, published_feedback, returned_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                submission.id.to_string(),
                submission.assignment_id.to_string(),
                submission.submitter_id.to_string(),
                submission.created_by.to_string(),
                submission.submitted_at.map(|t| t.to_rfc3339()),
                submission.status.as_str(),
                submission.official_run_id.map(|u| u.to_string()),
                submission.draft_score,
                submission.draft_feedback,
                submission.published_score,
                submission.published_feedback,
                submission.returned_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        for (position, artifact_id) in submission.artifact_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO submission_artifacts (submission_id, artifact_id, position)
                 VALUES (?1, ?2, ?3)",
                params![
                    submission.id.to_string(),
                    artifact_id.to_string(),
                    position as i64
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    /// Seed a workflow row
    pub async fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let conn = self.conn.lock().await;
        let selection = |s: &Option<PluginSelection>| -> (Option<String>, Option<String>) {
            match s {
                Some(sel) => (
                    Some(sel.plugin_id.clone()),
                    Some(Value::Object(sel.settings.clone()).to_string()),
                ),
                None => (None, None),
            }
        };
        let (t_id, t_settings) = selection(&workflow.transcriber);
        let (g_id, g_settings) = selection(&workflow.grader);
        let (v_id, v_settings) = selection(&workflow.validator);
        conn.execute(
            "INSERT INTO workflows (id, course_id, name, created_by,
                                    transcriber_plugin_id, transcriber_settings,
                                    grader_plugin_id, grader_settings,
                                    validator_plugin_id, validator_settings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                workflow.id.to_string(),
                workflow.course_id.to_string(),
                workflow.name,
                workflow.created_by.to_string(),
                t_id,
                t_settings,
                g_id,
                g_settings,
                v_id,
                v_settings,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn read_submission(tx: &Transaction<'_>, id: Uuid) -> Result<Option<Submission>> {
        let row = tx
            .query_row(
                "SELECT id, assignment_id, submitter_id, created_by, submitted_at, status,
                        official_run_id, draft_score, draft_feedback, published_score,
                        published_feedback, returned_at
                 FROM submissions WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<f64>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some(raw) = row else {
            return Ok(None);
        };

        let mut artifact_ids = Vec::new();
        let mut stmt = tx
            .prepare(
                "SELECT artifact_id FROM submission_artifacts
                 WHERE submission_id = ?1 ORDER BY position",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        for value in rows {
            artifact_ids.push(parse_uuid(&value.map_err(db_err)?)?);
        }

        Ok(Some(Submission {
            id: parse_uuid(&raw.0)?,
            assignment_id: parse_uuid(&raw.1)?,
            submitter_id: parse_uuid(&raw.2)?,
            created_by: parse_uuid(&raw.3)?,
            artifact_ids,
            submitted_at: parse_ts_opt(raw.4)?,
            status: SubmissionStatus::parse(&raw.5)
                .ok_or_else(|| Error::Persistence(format!("unknown submission status: {}", raw.5)))?,
            official_run_id: raw.6.as_deref().map(parse_uuid).transpose()?,
            draft_score: raw.7,
            draft_feedback: raw.8,
            published_score: raw.9,
            published_feedback: raw.10,
            returned_at: parse_ts_opt(raw.11)?,
        }))
    }

    fn write_submission(tx: &Transaction<'_>, submission: &Submission) -> Result<()> {
        tx.execute(
            "UPDATE submissions SET status = ?2, official_run_id = ?3, draft_score = ?4,
                    draft_feedback = ?5, published_score = ?6, published_feedback = ?7,
                    returned_at = ?8
             WHERE id = ?1",
            params![
                submission.id.to_string(),
                submission.status.as_str(),
                submission.official_run_id.map(|u| u.to_string()),
                submission.draft_score,
                submission.draft_feedback,
                submission.published_score,
                submission.published_feedback,
                submission.returned_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn load_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, course_id, name, created_by,
                        transcriber_plugin_id, transcriber_settings,
                        grader_plugin_id, grader_settings,
                        validator_plugin_id, validator_settings
                 FROM workflows WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some(raw) = row else {
            return Ok(None);
        };

        Ok(Some(Workflow {
            id: parse_uuid(&raw.0)?,
            course_id: parse_uuid(&raw.1)?,
            name: raw.2,
            created_by: parse_uuid(&raw.3)?,
            transcriber: parse_selection(raw.4, raw.5)?,
            grader: parse_selection(raw.6, raw.7)?,
            validator: parse_selection(raw.8, raw.9)?,
        }))
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, workflow_id, run_by, status, started_at, finished_at, logs
                 FROM workflow_runs WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some(raw) = row else {
            return Ok(None);
        };

        let mut submission_ids = Vec::new();
        let mut stmt = conn
            .prepare(
                "SELECT submission_id FROM workflow_run_submissions
                 WHERE workflow_run_id = ?1 ORDER BY position",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        for value in rows {
            submission_ids.push(parse_uuid(&value.map_err(db_err)?)?);
        }

        Ok(Some(WorkflowRun {
            id: parse_uuid(&raw.0)?,
            workflow_id: parse_uuid(&raw.1)?,
            run_by: parse_uuid(&raw.2)?,
            status: RunStatus::parse(&raw.3)
                .ok_or_else(|| Error::Persistence(format!("unknown run status: {}", raw.3)))?,
            started_at: parse_ts_opt(raw.4)?,
            finished_at: parse_ts_opt(raw.5)?,
            logs: serde_json::from_str::<RunLogs>(&raw.6)
                .map_err(|e| Error::Persistence(format!("corrupt run logs: {e}")))?,
            submission_ids,
        }))
    }

    async fn load_submissions(&self, ids: &[Uuid]) -> Result<Vec<SubmissionBundle>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        let mut bundles = Vec::new();

        for id in ids {
            let Some(submission) = Self::read_submission(&tx, *id)? else {
                continue;
            };

            let submitter = tx
                .query_row(
                    "SELECT id, name, email, user_id, is_synthetic FROM submitters WHERE id = ?1",
                    params![submission.submitter_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, bool>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| {
                    Error::Persistence(format!("submitter {} missing", submission.submitter_id))
                })?;

            let assignment = tx
                .query_row(
                    "SELECT id, course_id, title, description, deadline, max_grade
                     FROM assignments WHERE id = ?1",
                    params![submission.assignment_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| {
                    Error::Persistence(format!("assignment {} missing", submission.assignment_id))
                })?;

            let mut artifacts = Vec::new();
            for artifact_id in &submission.artifact_ids {
                let artifact = tx
                    .query_row(
                        "SELECT id, title, mime, storage_path, storage_kind, status,
                                access_level, creator_id, course_id, assignment_id, meta,
                                created_at, updated_at
                         FROM artifacts WHERE id = ?1",
                        params![artifact_id.to_string()],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, String>(5)?,
                                row.get::<_, String>(6)?,
                                row.get::<_, String>(7)?,
                                row.get::<_, Option<String>>(8)?,
                                row.get::<_, Option<String>>(9)?,
                                row.get::<_, Option<String>>(10)?,
                                row.get::<_, String>(11)?,
                                row.get::<_, String>(12)?,
                            ))
                        },
                    )
                    .optional()
                    .map_err(db_err)?;
                if let Some(raw) = artifact {
                    artifacts.push(Artifact {
                        id: parse_uuid(&raw.0)?,
                        title: raw.1,
                        mime: raw.2,
                        storage_path: raw.3,
                        storage_kind: raw.4,
                        status: parse_artifact_status(&raw.5)?,
                        access_level: parse_access_level(&raw.6)?,
                        creator_id: parse_uuid(&raw.7)?,
                        course_id: raw.8.as_deref().map(parse_uuid).transpose()?,
                        assignment_id: raw.9.as_deref().map(parse_uuid).transpose()?,
                        meta: raw.10.as_deref().map(parse_json).transpose()?,
                        created_at: parse_ts(&raw.11)?,
                        updated_at: parse_ts(&raw.12)?,
                    });
                }
            }

            bundles.push(SubmissionBundle {
                submission,
                submitter: Submitter {
                    id: parse_uuid(&submitter.0)?,
                    name: submitter.1,
                    email: submitter.2,
                    user_id: submitter.3.as_deref().map(parse_uuid).transpose()?,
                    is_synthetic: submitter.4,
                },
                assignment: Assignment {
                    id: parse_uuid(&assignment.0)?,
                    course_id: parse_uuid(&assignment.1)?,
                    title: assignment.2,
                    description: assignment.3,
                    deadline: parse_ts_opt(assignment.4)?,
                    max_grade: assignment.5.as_deref().map(parse_json).transpose()?,
                },
                artifacts,
            });
        }

        tx.commit().map_err(db_err)?;
        Ok(bundles)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO workflow_runs (id, workflow_id, run_by, status, started_at,
                                        finished_at, logs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id.to_string(),
                run.workflow_id.to_string(),
                run.run_by.to_string(),
                run.status.as_str(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&run.logs)?,
            ],
        )
        .map_err(db_err)?;
        for (position, submission_id) in run.submission_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO workflow_run_submissions (workflow_run_id, submission_id, position)
                 VALUES (?1, ?2, ?3)",
                params![
                    run.id.to_string(),
                    submission_id.to_string(),
                    position as i64
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    async fn update_run(&self, run_id: Uuid, patch: &RunPatch) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE workflow_runs SET
                     status = COALESCE(?2, status),
                     started_at = COALESCE(?3, started_at),
                     finished_at = COALESCE(?4, finished_at)
                 WHERE id = ?1",
                params![
                    run_id.to_string(),
                    patch.status.map(|s| s.as_str()),
                    patch.started_at.map(|t| t.to_rfc3339()),
                    patch.finished_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::Persistence(format!("run {run_id} not found")));
        }
        Ok(())
    }

    async fn update_submissions(&self, ids: &[Uuid], patch: &SubmissionPatch) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        for id in ids {
            let Some(mut submission) = Self::read_submission(&tx, *id)? else {
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
            Self::write_submission(&tx, &submission)?;
        }
        tx.commit().map_err(db_err)
    }

    async fn upsert_submission_result(
        &self,
        submission_id: Uuid,
        run_id: Uuid,
        patch: &ResultPatch,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;

        let existing = tx
            .query_row(
                "SELECT transcription, transcription_confidence, transcribed_at, score,
                        feedback, grading_meta, graded_at
                 FROM submission_results
                 WHERE submission_id = ?1 AND workflow_run_id = ?2",
                params![submission_id.to_string(), run_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let mut result = match existing {
            Some(raw) => SubmissionResult {
                submission_id,
                run_id,
                transcription: raw.0,
                transcription_confidence: raw.1,
                transcribed_at: parse_ts_opt(raw.2)?,
                score: raw.3,
                feedback: raw.4,
                grading_meta: raw.5.as_deref().map(parse_json).transpose()?,
                graded_at: parse_ts_opt(raw.6)?,
            },
            None => SubmissionResult::new(submission_id, run_id),
        };

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

        tx.execute(
            "INSERT OR REPLACE INTO submission_results
                 (submission_id, workflow_run_id, transcription, transcription_confidence,
                  transcribed_at, score, feedback, grading_meta, graded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                submission_id.to_string(),
                run_id.to_string(),
                result.transcription,
                result.transcription_confidence,
                result.transcribed_at.map(|t| t.to_rfc3339()),
                result.score,
                result.feedback,
                result.grading_meta.as_ref().map(Value::to_string),
                result.graded_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)
    }

    async fn append_run_log(&self, run_id: Uuid, entry: &Envelope) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT logs FROM workflow_runs WHERE id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(raw) = raw else {
            return Err(Error::Persistence(format!("run {run_id} not found")));
        };
        let mut logs: RunLogs = serde_json::from_str(&raw)
            .map_err(|e| Error::Persistence(format!("corrupt run logs: {e}")))?;
        logs.history.push(entry.clone());
        tx.execute(
            "UPDATE workflow_runs SET logs = ?2 WHERE id = ?1",
            params![run_id.to_string(), serde_json::to_string(&logs)?],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    async fn record_submission_event(&self, event: &SubmissionEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO submission_events (id, submission_id, event_type, actor_id,
                                            workflow_run_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id.to_string(),
                event.submission_id.to_string(),
                event.event_type.as_str(),
                event.actor_id.map(|u| u.to_string()),
                event.run_id.map(|u| u.to_string()),
                event.details.as_ref().map(Value::to_string),
                event.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Persistence(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Persistence(format!("invalid uuid '{s}': {e}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("invalid timestamp '{s}': {e}")))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_json(s: &str) -> Result<Value> {
    serde_json::from_str(s).map_err(|e| Error::Persistence(format!("invalid json: {e}")))
}

fn parse_selection(
    plugin_id: Option<String>,
    settings: Option<String>,
) -> Result<Option<PluginSelection>> {
    let Some(plugin_id) = plugin_id else {
        return Ok(None);
    };
    let settings = match settings {
        Some(raw) => match parse_json(&raw)? {
            Value::Object(map) => map,
            _ => {
                return Err(Error::Persistence(
                    "plugin settings must be a json object".to_string(),
                ))
            }
        },
        None => Default::default(),
    };
    Ok(Some(PluginSelection {
        plugin_id,
        settings,
    }))
}

fn status_str(status: ArtifactStatus) -> &'static str {
    match status {
        ArtifactStatus::Pending => "pending",
        ArtifactStatus::Attached => "attached",
        ArtifactStatus::Orphaned => "orphaned",
        ArtifactStatus::Archived => "archived",
        ArtifactStatus::Deleted => "deleted",
    }
}

fn parse_artifact_status(s: &str) -> Result<ArtifactStatus> {
    match s {
        "pending" => Ok(ArtifactStatus::Pending),
        "attached" => Ok(ArtifactStatus::Attached),
        "orphaned" => Ok(ArtifactStatus::Orphaned),
        "archived" => Ok(ArtifactStatus::Archived),
        "deleted" => Ok(ArtifactStatus::Deleted),
        _ => Err(Error::Persistence(format!("unknown artifact status: {s}"))),
    }
}

fn access_str(level: AccessLevel) -> &'static str {
    match level {
        AccessLevel::Private => "private",
        AccessLevel::Course => "course",
        AccessLevel::Assignment => "assignment",
        AccessLevel::Public => "public",
    }
}

fn parse_access_level(s: &str) -> Result<AccessLevel> {
    match s {
        "private" => Ok(AccessLevel::Private),
        "course" => Ok(AccessLevel::Course),
        "assignment" => Ok(AccessLevel::Assignment),
        "public" => Ok(AccessLevel::Public),
        _ => Err(Error::Persistence(format!("unknown access level: {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SubmissionStatus;
    use serde_json::json;

    fn submitter() -> Submitter {
        Submitter {
            id: Uuid::new_v4(),
            name: "Ada".to_string(),
            email: Some("ada@example.edu".to_string()),
            user_id: None,
            is_synthetic: false,
        }
    }

    fn assignment() -> Assignment {
        Assignment {
            id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            title: "Essay".to_string(),
            description: Some("Write about cells".to_string()),
            deadline: None,
            max_grade: Some(json!({"value": 10.0})),
        }
    }

    fn submission(submitter_id: Uuid, assignment_id: Uuid) -> Submission {
        Submission {
            id: Uuid::new_v4(),
            assignment_id,
            submitter_id,
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
        }
    }

    async fn seeded_gateway() -> (SqliteGateway, Uuid, Uuid) {
        let gateway = SqliteGateway::in_memory().unwrap();
        let s = submitter();
        let a = assignment();
        let sub = submission(s.id, a.id);
        let sub_id = sub.id;
        gateway.insert_submitter(&s).await.unwrap();
        gateway.insert_assignment(&a).await.unwrap();
        gateway.insert_submission(&sub).await.unwrap();

        let workflow = Workflow {
            id: Uuid::new_v4(),
            course_id: a.course_id,
            name: "Default grading".to_string(),
            created_by: Uuid::new_v4(),
            transcriber: Some(PluginSelection {
                plugin_id: "demo.transcriber".to_string(),
                settings: Default::default(),
            }),
            grader: None,
            validator: None,
        };
        let workflow_id = workflow.id;
        gateway.insert_workflow(&workflow).await.unwrap();
        (gateway, sub_id, workflow_id)
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let (gateway, _, workflow_id) = seeded_gateway().await;
        let workflow = gateway.load_workflow(workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.name, "Default grading");
        let transcriber = workflow.transcriber.unwrap();
        assert_eq!(transcriber.plugin_id, "demo.transcriber");
        assert!(workflow.grader.is_none());
        assert!(gateway.load_workflow(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (gateway, sub_id, workflow_id) = seeded_gateway().await;
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            workflow_id,
            run_by: Uuid::new_v4(),
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            logs: Default::default(),
            submission_ids: vec![sub_id],
        };
        gateway.create_run(&run).await.unwrap();

        let started = Utc::now();
        gateway
            .update_run(run.id, &RunPatch::status(RunStatus::Running).with_started_at(started))
            .await
            .unwrap();

        gateway
            .append_run_log(run.id, &Envelope::close("done"))
            .await
            .unwrap();

        let loaded = gateway.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.submission_ids, vec![sub_id]);
        assert_eq!(loaded.logs.history.len(), 1);

        let err = gateway
            .update_run(Uuid::new_v4(), &RunPatch::status(RunStatus::Failure))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[tokio::test]
    async fn test_submission_patch_and_bundle() {
        let (gateway, sub_id, _) = seeded_gateway().await;
        let run_id = Uuid::new_v4();

        gateway
            .update_submissions(
                &[sub_id, Uuid::new_v4()],
                &SubmissionPatch::status(SubmissionStatus::Processing).with_official_run(run_id),
            )
            .await
            .unwrap();

        let bundles = gateway.load_submissions(&[sub_id]).await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].submission.status, SubmissionStatus::Processing);
        assert_eq!(bundles[0].submission.official_run_id, Some(run_id));
        assert_eq!(bundles[0].submitter.name, "Ada");
        assert_eq!(bundles[0].assignment.max_score(), 10.0);
    }

    #[tokio::test]
    async fn test_result_upsert_cumulative() {
        let (gateway, sub_id, workflow_id) = seeded_gateway().await;
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            workflow_id,
            run_by: Uuid::new_v4(),
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            finished_at: None,
            logs: Default::default(),
            submission_ids: vec![sub_id],
        };
        gateway.create_run(&run).await.unwrap();

        let now = Utc::now();
        gateway
            .upsert_submission_result(sub_id, run.id, &ResultPatch::transcription("text", 0.8, now))
            .await
            .unwrap();
        gateway
            .upsert_submission_result(
                sub_id,
                run.id,
                &ResultPatch::grade(9.0, "solid", json!({"rubric": "r1"}), now),
            )
            .await
            .unwrap();

        // read back through a second upsert round-trip: meta-only annotation
        gateway
            .upsert_submission_result(sub_id, run.id, &ResultPatch::meta(json!({"validated": true})))
            .await
            .unwrap();

        let conn = gateway.conn.lock().await;
        let (transcription, score, meta): (Option<String>, Option<f64>, Option<String>) = conn
            .query_row(
                "SELECT transcription, score, grading_meta FROM submission_results
                 WHERE submission_id = ?1 AND workflow_run_id = ?2",
                params![sub_id.to_string(), run.id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(transcription.as_deref(), Some("text"));
        assert_eq!(score, Some(9.0));
        assert_eq!(meta.as_deref(), Some("{\"validated\":true}"));
    }

    #[tokio::test]
    async fn test_submission_event_recorded() {
        let (gateway, sub_id, _) = seeded_gateway().await;
        let event = SubmissionEvent {
            id: Uuid::new_v4(),
            submission_id: sub_id,
            event_type: SubmissionEventType::AiGraded,
            actor_id: None,
            run_id: None,
            details: Some(json!({"score": 9.0})),
            created_at: Utc::now(),
        };
        gateway.record_submission_event(&event).await.unwrap();

        let conn = gateway.conn.lock().await;
        let kind: String = conn
            .query_row(
                "SELECT event_type FROM submission_events WHERE submission_id = ?1",
                params![sub_id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(kind, "ai_graded");
    }
}
