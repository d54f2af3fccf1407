//! Commit-then-emit persistence wrapper
//!
//! The gateway is storage-only; this wrapper pairs it with the session bus
//! and implements the update contract: commit the patch, then emit an
//! `update` envelope carrying exactly the applied fields. It also owns the
//! best-effort log history append, reporting the first failure through the
//! session logger and suppressing the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::domain::SubmissionEvent;
use crate::error::Result;
use crate::events::{Envelope, Handler, IndexedEventBus, Topic, UpdateObject};
use crate::logging::SessionLogger;
use crate::persist::{PersistenceGateway, ResultPatch, RunPatch, SubmissionPatch};

use super::Session;

/// Session-scoped persistence with post-commit update envelopes
pub struct SessionPersistence {
    gateway: Arc<dyn PersistenceGateway>,
    bus: Arc<IndexedEventBus>,
    logger: SessionLogger,
    run_id: Uuid,
    log_write_failed: AtomicBool,
}

impl SessionPersistence {
    /// Wrap the gateway for one session
    pub fn new(gateway: Arc<dyn PersistenceGateway>, session: &Session) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            bus: Arc::clone(session.bus()),
            logger: session.logger().clone(),
            run_id: session.id(),
            log_write_failed: AtomicBool::new(false),
        })
    }

    /// Subscribe the log-history persister on the session bus
    ///
    /// Every log, update, and close envelope is appended to the run row the
    /// moment it is delivered, matching what subscribers saw.
    pub fn attach_history_recorder(self: &Arc<Self>, session: &Session) {
        for topic in Topic::all() {
            let persistence = Arc::clone(self);
            session.bus().subscribe(
                topic,
                Handler::from_async(move |envelope: Arc<Envelope>| {
                    let persistence = Arc::clone(&persistence);
                    async move {
                        persistence.persist_log(&envelope).await;
                        Ok(())
                    }
                }),
            );
        }
    }

    /// Load submissions with their submitter, assignment, and artifacts
    pub async fn load_submissions(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<crate::domain::SubmissionBundle>> {
        self.gateway.load_submissions(ids).await
    }

    /// Commit a run patch, then emit the matching update envelope
    pub async fn update_run(&self, patch: RunPatch) -> Result<()> {
        self.gateway.update_run(self.run_id, &patch).await?;

        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(self.run_id));
        if let Some(status) = patch.status {
            payload.insert("status".to_string(), json!(status));
        }
        if let Some(started_at) = patch.started_at {
            payload.insert("started_at".to_string(), json!(started_at.to_rfc3339()));
        }
        if let Some(finished_at) = patch.finished_at {
            payload.insert("finished_at".to_string(), json!(finished_at.to_rfc3339()));
        }
        self.bus
            .emit(Envelope::update(
                UpdateObject::WorkflowRun,
                Value::Object(payload),
            ))
            .await;
        Ok(())
    }

    /// Commit a submissions patch, then emit the matching update envelope
    pub async fn update_submissions(&self, ids: &[Uuid], patch: SubmissionPatch) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.gateway.update_submissions(ids, &patch).await?;

        let items: Vec<Value> = ids
            .iter()
            .map(|id| {
                let mut item = Map::new();
                item.insert("id".to_string(), json!(id));
                if let Some(status) = patch.status {
                    item.insert("status".to_string(), json!(status));
                }
                if let Some(run_id) = patch.official_run_id {
                    item.insert("official_run_id".to_string(), json!(run_id));
                }
                if let Some(score) = patch.draft_score {
                    item.insert("draft_score".to_string(), json!(score));
                }
                if let Some(feedback) = &patch.draft_feedback {
                    item.insert("draft_feedback".to_string(), json!(feedback));
                }
                Value::Object(item)
            })
            .collect();
        self.bus
            .emit(Envelope::update(UpdateObject::Submissions, Value::Array(items)))
            .await;
        Ok(())
    }

    /// Create-or-merge a result record; no envelope is emitted
    pub async fn upsert_result(
        &self,
        submission_id: Uuid,
        patch: &ResultPatch,
    ) -> Result<()> {
        self.gateway
            .upsert_submission_result(submission_id, self.run_id, patch)
            .await
    }

    /// Record an audit entry; no envelope is emitted
    pub async fn record_event(&self, event: &SubmissionEvent) -> Result<()> {
        self.gateway.record_submission_event(event).await
    }

    async fn persist_log(&self, envelope: &Envelope) {
        if let Err(e) = self.gateway.append_run_log(self.run_id, envelope).await {
            if !self.log_write_failed.swap(true, Ordering::AcqRel) {
                self.logger
                    .error(format!("Failed to persist session log: {e}"));
            }
        }
    }
}
