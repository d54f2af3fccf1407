//! The pipeline engine
//!
//! Drives one workflow run through its stages: transcription, grading,
//! validation. Plugin calls are dispatched with bounded parallelism and
//! per-item isolation — a failing call marks that submission `failure` and
//! the stage continues. Stage setup errors (resolution, construction,
//! settings, persistence) are fatal to the run.
//!
//! The runner owns a snapshot of the workflow's plugin selections taken at
//! session creation, so edits to the workflow cannot affect a running
//! session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use crate::domain::{
    PluginSelection, RunStatus, SubmissionBundle, SubmissionEvent, SubmissionEventType,
    SubmissionStatus, Workflow,
};
use crate::error::{Error, Result};
use crate::events::Envelope;
use crate::plugin::{
    GradePlugin, GradeResult, PluginRegistry, SubmissionView, TranscribedSubmission,
    TranscriptionPlugin, ValidationPlugin,
};

use super::{Session, SessionPersistence};

/// How long the logger gets to drain when the session ends
const LOGGER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Run-fatal failure: terminal state, close reason, optional error log line
struct Fatal {
    reason: String,
    log: Option<String>,
}

impl Fatal {
    fn new(reason: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            log: Some(log.into()),
        }
    }

    fn cancelled() -> Self {
        Self {
            reason: "cancelled".to_string(),
            log: Some("Session cancelled".to_string()),
        }
    }
}

/// Executes one session's pipeline
pub struct SessionRunner {
    session: Arc<Session>,
    persistence: Arc<SessionPersistence>,
    registry: Arc<PluginRegistry>,
    run_id: Uuid,
    run_by: Uuid,
    workflow_name: String,
    transcriber: Option<PluginSelection>,
    grader: Option<PluginSelection>,
    validator: Option<PluginSelection>,
    submission_ids: Vec<Uuid>,
    parallelism: usize,
    call_timeout: Option<Duration>,
    cancel: watch::Receiver<bool>,
    /// Last status this runner gave each submission
    statuses: HashMap<Uuid, SubmissionStatus>,
}

impl SessionRunner {
    /// Build a runner with a snapshot of the workflow's plugin selections
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: Arc<Session>,
        persistence: Arc<SessionPersistence>,
        registry: Arc<PluginRegistry>,
        workflow: &Workflow,
        submission_ids: Vec<Uuid>,
        run_by: Uuid,
        parallelism: usize,
        call_timeout: Option<Duration>,
    ) -> Self {
        let cancel = session.cancel_signal();
        Self {
            run_id: session.id(),
            session,
            persistence,
            registry,
            run_by,
            workflow_name: workflow.name.clone(),
            transcriber: workflow.transcriber.clone(),
            grader: workflow.grader.clone(),
            validator: workflow.validator.clone(),
            submission_ids,
            parallelism: parallelism.max(1),
            call_timeout,
            cancel,
            statuses: HashMap::new(),
        }
    }

    /// Drive the pipeline to a terminal state and emit the close envelope
    pub async fn run(mut self) {
        let session = Arc::clone(&self.session);
        match self.drive().await {
            Ok(()) => {
                session.logger().flush().await;
                session.bus().emit(Envelope::close("session completed")).await;
            }
            Err(fatal) => {
                if let Some(log) = &fatal.log {
                    session.logger().error(log.clone());
                }
                if let Err(e) = self
                    .persistence
                    .update_run(
                        crate::persist::RunPatch::status(RunStatus::Failure)
                            .with_finished_at(Utc::now()),
                    )
                    .await
                {
                    tracing::warn!(session_id = %self.run_id, error = %e, "Failed to record run failure");
                }

                let pending = self.non_terminal_ids();
                if let Err(e) = self
                    .persistence
                    .update_submissions(
                        &pending,
                        crate::persist::SubmissionPatch::status(SubmissionStatus::Failure),
                    )
                    .await
                {
                    tracing::warn!(session_id = %self.run_id, error = %e, "Failed to mark submissions failed");
                }

                session.logger().flush().await;
                session.bus().emit(Envelope::close(fatal.reason)).await;
            }
        }
        session.logger().stop(LOGGER_STOP_TIMEOUT).await;
    }

    /// Submissions this runner has not yet brought to a terminal state
    ///
    /// Before any tracking happened (failure during startup) every requested
    /// submission counts as pending.
    fn non_terminal_ids(&self) -> Vec<Uuid> {
        if self.statuses.is_empty() {
            return self.submission_ids.clone();
        }
        self.statuses
            .iter()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn check_cancelled(&self) -> std::result::Result<(), Fatal> {
        if self.is_cancelled() {
            Err(Fatal::cancelled())
        } else {
            Ok(())
        }
    }

    async fn move_submissions(
        &mut self,
        ids: &[Uuid],
        patch: crate::persist::SubmissionPatch,
    ) -> std::result::Result<(), Fatal> {
        if ids.is_empty() {
            return Ok(());
        }
        let status = patch.status;
        self.persistence
            .update_submissions(ids, patch)
            .await
            .map_err(|e| {
                Fatal::new(
                    "failed to update submissions",
                    format!("Failed to update submission state: {e}"),
                )
            })?;
        if let Some(status) = status {
            for id in ids {
                self.statuses.insert(*id, status);
            }
        }
        Ok(())
    }

    async fn drive(&mut self) -> std::result::Result<(), Fatal> {
        let logger = self.session.logger().clone();
        logger.info(format!(
            "Starting session for workflow {} over {} submissions",
            self.workflow_name,
            self.submission_ids.len()
        ));

        self.persistence
            .update_run(
                crate::persist::RunPatch::status(RunStatus::Running).with_started_at(Utc::now()),
            )
            .await
            .map_err(|e| {
                Fatal::new(
                    "failed to start session",
                    format!("Failed to mark run as running: {e}"),
                )
            })?;

        let submission_ids = self.submission_ids.clone();
        let bundles = self
            .persistence
            .load_submissions(&submission_ids)
            .await
            .map_err(|e| {
                Fatal::new(
                    "failed to load submissions",
                    format!("Failed to load submissions: {e}"),
                )
            })?;
        if bundles.is_empty() {
            return Err(Fatal::new(
                "no valid submissions",
                "No valid submissions found for this session",
            ));
        }

        for bundle in &bundles {
            self.statuses
                .insert(bundle.submission.id, bundle.submission.status);
        }
        let all_ids: Vec<Uuid> = bundles.iter().map(|b| b.submission.id).collect();
        let run_id = self.run_id;
        self.move_submissions(
            &all_ids,
            crate::persist::SubmissionPatch::status(SubmissionStatus::Processing)
                .with_official_run(run_id),
        )
        .await?;

        // Transcription is required in the current design
        let (views, transcribed) = self.transcription_stage(&bundles, &all_ids).await?;

        // Grading, if configured
        let graded = self.grading_stage(&bundles, &views, &transcribed).await?;

        // Validation, if configured; post-processing only
        self.validation_stage(&bundles, &graded).await?;

        self.persistence
            .update_run(
                crate::persist::RunPatch::status(RunStatus::Success).with_finished_at(Utc::now()),
            )
            .await
            .map_err(|e| {
                Fatal::new(
                    "failed to finalize session",
                    format!("Failed to mark run as finished: {e}"),
                )
            })?;
        Ok(())
    }

    async fn transcription_stage(
        &mut self,
        bundles: &[SubmissionBundle],
        all_ids: &[Uuid],
    ) -> std::result::Result<(Vec<SubmissionView>, HashMap<usize, TranscribedSubmission>), Fatal>
    {
        let logger = self.session.logger().clone();

        let Some(selection) = self.transcriber.clone() else {
            return Err(Fatal::new(
                "missing transcription step",
                "No transcription step configured; grading without transcription is not supported",
            ));
        };

        self.check_cancelled()?;
        logger.info("Starting transcription step");

        let plugin = self
            .registry
            .instantiate_transcriber(
                &selection.plugin_id,
                logger.get_child(selection.plugin_id.as_str()),
                &selection.settings,
            )
            .map_err(|e| stage_setup_failure("transcriber", &selection.plugin_id, e))?;
        let plugin: Arc<dyn TranscriptionPlugin> = Arc::from(plugin);

        self.move_submissions(
            all_ids,
            crate::persist::SubmissionPatch::status(SubmissionStatus::Transcribing),
        )
        .await?;

        let views: Vec<SubmissionView> = bundles.iter().map(SubmissionView::from_bundle).collect();
        let calls: Vec<BoxFuture<'static, Result<TranscribedSubmission>>> = views
            .iter()
            .map(|view| transcription_call(Arc::clone(&plugin), view.clone()))
            .collect();
        let results = self.run_bounded(calls).await;
        self.check_cancelled()?;

        let mut transcribed = HashMap::new();
        let mut ok_ids = Vec::new();
        let mut failed_ids = Vec::new();
        for (idx, result) in results.into_iter().enumerate() {
            let bundle = &bundles[idx];
            let submitter = &bundle.submitter.name;
            let submission_id = bundle.submission.id;
            match result {
                Ok(item) => {
                    let patch = crate::persist::ResultPatch::transcription(
                        item.transcription.clone(),
                        item.confidence,
                        Utc::now(),
                    );
                    match self.persistence.upsert_result(submission_id, &patch).await {
                        Ok(()) => {
                            transcribed.insert(idx, item);
                            ok_ids.push(submission_id);
                        }
                        Err(e) => {
                            logger.error(format!(
                                "Failed to store transcription for {submitter}'s submission: {e}"
                            ));
                            failed_ids.push(submission_id);
                        }
                    }
                }
                Err(e) => {
                    logger.error(format!(
                        "Transcription failed for {submitter}'s submission: {e}"
                    ));
                    failed_ids.push(submission_id);
                }
            }
        }

        self.move_submissions(
            &failed_ids,
            crate::persist::SubmissionPatch::status(SubmissionStatus::Failure),
        )
        .await?;
        self.move_submissions(
            &ok_ids,
            crate::persist::SubmissionPatch::status(SubmissionStatus::Transcribed),
        )
        .await?;

        logger.info("Transcription step completed");
        Ok((views, transcribed))
    }

    async fn grading_stage(
        &mut self,
        bundles: &[SubmissionBundle],
        views: &[SubmissionView],
        transcribed: &HashMap<usize, TranscribedSubmission>,
    ) -> std::result::Result<Vec<(usize, GradeResult)>, Fatal> {
        let logger = self.session.logger().clone();
        let mut graded = Vec::new();

        let Some(selection) = self.grader.clone() else {
            return Ok(graded);
        };

        self.check_cancelled()?;
        logger.info("Starting grading step");

        let plugin = self
            .registry
            .instantiate_grader(
                &selection.plugin_id,
                logger.get_child(selection.plugin_id.as_str()),
                &selection.settings,
            )
            .map_err(|e| stage_setup_failure("grader", &selection.plugin_id, e))?;
        let plugin: Arc<dyn GradePlugin> = Arc::from(plugin);

        let mut survivor_idx: Vec<usize> = (0..bundles.len())
            .filter(|idx| transcribed.contains_key(idx))
            .collect();
        survivor_idx.retain(|idx| {
            self.statuses
                .get(&bundles[*idx].submission.id)
                .map(|s| !s.is_terminal())
                .unwrap_or(false)
        });

        if survivor_idx.is_empty() {
            logger.warning("No submissions to grade, skipping grading step");
            logger.info("Grading step completed");
            return Ok(graded);
        }

        let survivor_ids: Vec<Uuid> = survivor_idx
            .iter()
            .map(|idx| bundles[*idx].submission.id)
            .collect();
        self.move_submissions(
            &survivor_ids,
            crate::persist::SubmissionPatch::status(SubmissionStatus::Grading),
        )
        .await?;

        let calls: Vec<BoxFuture<'static, Result<GradeResult>>> = survivor_idx
            .iter()
            .map(|idx| {
                grade_call(
                    Arc::clone(&plugin),
                    transcribed[idx].clone(),
                    views[*idx].clone(),
                )
            })
            .collect();
        let results = self.run_bounded(calls).await;
        self.check_cancelled()?;

        let mut ok_ids = Vec::new();
        let mut failed_ids = Vec::new();
        for (pos, result) in results.into_iter().enumerate() {
            let idx = survivor_idx[pos];
            let bundle = &bundles[idx];
            let submitter = &bundle.submitter.name;
            let submission_id = bundle.submission.id;
            match result {
                Ok(grade) => {
                    match self.persist_grade(submission_id, &grade).await {
                        Ok(()) => {
                            ok_ids.push(submission_id);
                            graded.push((idx, grade));
                        }
                        Err(e) => {
                            logger.error(format!(
                                "Failed to store grade for {submitter}'s submission: {e}"
                            ));
                            failed_ids.push(submission_id);
                        }
                    }
                }
                Err(e) => {
                    logger.error(format!("Grading failed for {submitter}'s submission: {e}"));
                    failed_ids.push(submission_id);
                }
            }
        }

        self.move_submissions(
            &failed_ids,
            crate::persist::SubmissionPatch::status(SubmissionStatus::Failure),
        )
        .await?;
        self.move_submissions(
            &ok_ids,
            crate::persist::SubmissionPatch::status(SubmissionStatus::Graded),
        )
        .await?;

        logger.info("Grading step completed");
        Ok(graded)
    }

    /// Persist one grade: result upsert, audit event, draft fields
    async fn persist_grade(&self, submission_id: Uuid, grade: &GradeResult) -> Result<()> {
        let now = Utc::now();
        self.persistence
            .upsert_result(
                submission_id,
                &crate::persist::ResultPatch::grade(
                    grade.score,
                    grade.feedback.clone(),
                    Value::Object(grade.meta.clone()),
                    now,
                ),
            )
            .await?;

        let event = SubmissionEvent {
            id: Uuid::new_v4(),
            submission_id,
            event_type: SubmissionEventType::AiGraded,
            actor_id: Some(self.run_by),
            run_id: Some(self.run_id),
            details: Some(json!({"score": grade.score})),
            created_at: now,
        };
        self.persistence.record_event(&event).await?;

        self.persistence
            .update_submissions(
                &[submission_id],
                crate::persist::SubmissionPatch::draft(grade.score, grade.feedback.clone()),
            )
            .await
    }

    async fn validation_stage(
        &mut self,
        bundles: &[SubmissionBundle],
        graded: &[(usize, GradeResult)],
    ) -> std::result::Result<(), Fatal> {
        let logger = self.session.logger().clone();

        let Some(selection) = self.validator.clone() else {
            return Ok(());
        };

        self.check_cancelled()?;
        logger.info("Starting validation step");

        let plugin = self
            .registry
            .instantiate_validator(
                &selection.plugin_id,
                logger.get_child(selection.plugin_id.as_str()),
                &selection.settings,
            )
            .map_err(|e| stage_setup_failure("validator", &selection.plugin_id, e))?;
        let plugin: Arc<dyn ValidationPlugin> = Arc::from(plugin);

        if graded.is_empty() {
            logger.warning("No graded submissions to validate, skipping validation step");
            logger.info("Validation step completed");
            return Ok(());
        }

        let calls: Vec<BoxFuture<'static, Result<bool>>> = graded
            .iter()
            .map(|(_, grade)| validate_call(Arc::clone(&plugin), grade.clone()))
            .collect();
        let results = self.run_bounded(calls).await;
        self.check_cancelled()?;

        for ((idx, grade), result) in graded.iter().zip(results) {
            let bundle = &bundles[*idx];
            let submitter = &bundle.submitter.name;
            match result {
                Ok(valid) => {
                    let mut meta = grade.meta.clone();
                    meta.insert("validated".to_string(), json!(valid));
                    if let Err(e) = self
                        .persistence
                        .upsert_result(
                            bundle.submission.id,
                            &crate::persist::ResultPatch::meta(Value::Object(meta)),
                        )
                        .await
                    {
                        logger.warning(format!(
                            "Failed to annotate validation for {submitter}'s submission: {e}"
                        ));
                    }
                    if !valid {
                        logger.warning(format!("Validation flagged {submitter}'s submission"));
                    }
                }
                Err(e) => {
                    logger.error(format!(
                        "Validation failed for {submitter}'s submission: {e}"
                    ));
                }
            }
        }

        logger.info("Validation step completed");
        Ok(())
    }

    /// Dispatch plugin calls with at most `parallelism` in flight
    ///
    /// Each call runs in its own task: panics and errors stay per-item. A
    /// configured timeout counts as a per-item failure. Once cancellation is
    /// observed no queued call starts; in-flight async calls unwind at their
    /// next await, in-flight blocking calls finish on the worker pool.
    async fn run_bounded<T: Send + 'static>(
        &self,
        calls: Vec<BoxFuture<'static, Result<T>>>,
    ) -> Vec<Result<T>> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let timeout = self.call_timeout;

        let handles: Vec<tokio::task::JoinHandle<Result<T>>> = calls
            .into_iter()
            .map(|call| {
                let semaphore = Arc::clone(&semaphore);
                let mut cancel = self.cancel.clone();
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return Err(Error::Cancelled),
                    };
                    if *cancel.borrow() {
                        return Err(Error::Cancelled);
                    }

                    let bounded = async move {
                        match timeout {
                            Some(duration) => match tokio::time::timeout(duration, call).await {
                                Ok(result) => result,
                                Err(_) => Err(Error::Timeout {
                                    timeout_ms: duration.as_millis() as u64,
                                }),
                            },
                            None => call.await,
                        }
                    };
                    tokio::pin!(bounded);
                    tokio::select! {
                        result = &mut bounded => result,
                        _ = cancel.changed() => Err(Error::Cancelled),
                    }
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::PluginRuntime(format!("plugin task panicked: {e}"))),
            });
        }
        results
    }
}

fn stage_setup_failure(stage: &str, plugin_id: &str, error: Error) -> Fatal {
    match &error {
        Error::PluginNotFound(_) => Fatal::new(
            format!("missing {stage} plugin"),
            format!("{stage} plugin not found: {plugin_id}"),
        ),
        Error::PluginInit { .. } => Fatal::new(
            format!("{stage} plugin initialization error"),
            error.to_string(),
        ),
        Error::Settings(_) => Fatal::new(format!("{stage} configuration error"), error.to_string()),
        _ => Fatal::new(format!("{stage} setup failed"), error.to_string()),
    }
}

fn transcription_call(
    plugin: Arc<dyn TranscriptionPlugin>,
    view: SubmissionView,
) -> BoxFuture<'static, Result<TranscribedSubmission>> {
    if plugin.blocking() {
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || plugin.transcribe_blocking(&view)).await {
                Ok(result) => result,
                Err(e) => Err(Error::PluginRuntime(format!("plugin worker panicked: {e}"))),
            }
        })
    } else {
        Box::pin(async move { plugin.transcribe(&view).await })
    }
}

fn grade_call(
    plugin: Arc<dyn GradePlugin>,
    transcribed: TranscribedSubmission,
    view: SubmissionView,
) -> BoxFuture<'static, Result<GradeResult>> {
    if plugin.blocking() {
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || plugin.grade_blocking(&transcribed, &view))
                .await
            {
                Ok(result) => result,
                Err(e) => Err(Error::PluginRuntime(format!("plugin worker panicked: {e}"))),
            }
        })
    } else {
        Box::pin(async move { plugin.grade(&transcribed, &view).await })
    }
}

fn validate_call(
    plugin: Arc<dyn ValidationPlugin>,
    grade: GradeResult,
) -> BoxFuture<'static, Result<bool>> {
    if plugin.blocking() {
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || plugin.validate_one_blocking(&grade)).await {
                Ok(result) => result,
                Err(e) => Err(Error::PluginRuntime(format!("plugin worker panicked: {e}"))),
            }
        })
    } else {
        Box::pin(async move { plugin.validate_one(&grade).await })
    }
}
