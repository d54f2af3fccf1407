//! Public entry point for session execution

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{EngineConfig, LogPersistence};
use crate::domain::{RunStatus, RunView, WorkflowRun};
use crate::error::{Error, Result};
use crate::persist::PersistenceGateway;
use crate::plugin::PluginRegistry;

use super::{Session, SessionPersistence, SessionRunner, SessionStore};

/// Creates, tracks, and tears down sessions
pub struct SessionManager {
    config: EngineConfig,
    registry: Arc<PluginRegistry>,
    gateway: Arc<dyn PersistenceGateway>,
    store: Arc<SessionStore>,
}

impl SessionManager {
    /// Build a manager over a plugin registry and a persistence gateway
    pub fn new(
        config: EngineConfig,
        registry: Arc<PluginRegistry>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        if config.log_persistence == LogPersistence::Strict {
            tracing::warn!("Strict log persistence is not implemented, using best-effort");
        }
        let store = Arc::new(SessionStore::new(config.session_evict_grace));
        Self {
            config,
            registry,
            gateway,
            store,
        }
    }

    /// The session store, for transports that resolve subscribers
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The plugin registry backing this manager
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Create a session: insert the pending run, register the live handle,
    /// spawn the runner, and return a view of the new run
    ///
    /// `parallelism` overrides the configured bound for this session only.
    pub async fn create_session(
        &self,
        workflow_id: Uuid,
        submission_ids: Vec<Uuid>,
        principal: Uuid,
        parallelism: Option<usize>,
    ) -> Result<RunView> {
        if submission_ids.is_empty() {
            return Err(Error::Config(
                "at least one submission id must be provided".to_string(),
            ));
        }
        let workflow = self
            .gateway
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::Config("workflow not found".to_string()))?;

        let run_id = Uuid::new_v4();
        let run = WorkflowRun {
            id: run_id,
            workflow_id,
            run_by: principal,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            logs: Default::default(),
            submission_ids: submission_ids.clone(),
        };
        self.gateway.create_run(&run).await?;

        let session = Session::new(run_id, &self.config);
        let persistence = SessionPersistence::new(Arc::clone(&self.gateway), &session);
        persistence.attach_history_recorder(&session);
        self.store.insert(Arc::clone(&session));

        let runner = SessionRunner::new(
            Arc::clone(&session),
            persistence,
            Arc::clone(&self.registry),
            &workflow,
            submission_ids.clone(),
            principal,
            parallelism.unwrap_or(self.config.parallelism),
            self.config.plugin_call_timeout,
        );
        let store = Arc::clone(&self.store);
        let task = tokio::spawn(async move {
            runner.run().await;
            store.schedule_evict(run_id);
        });
        session.attach_task(task);

        let bundles = self.gateway.load_submissions(&submission_ids).await?;
        Ok(RunView::from_run(&run, &bundles))
    }

    /// Live session handle, if the id is known and not yet evicted
    pub fn get(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.store.get(session_id)
    }

    /// Ask a session to stop; returns false for unknown ids
    pub fn cancel(&self, session_id: Uuid) -> bool {
        match self.store.get(session_id) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active session and await termination up to the deadline
    pub async fn shutdown(&self, deadline: Duration) {
        let sessions: Vec<Arc<Session>> = self
            .store
            .ids()
            .into_iter()
            .filter_map(|id| self.store.get(id))
            .collect();

        for session in &sessions {
            session.cancel();
        }

        let handles: Vec<_> = sessions.iter().filter_map(|s| s.take_task()).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = futures::future::join_all(handles);
        if tokio::time::timeout(deadline, drained).await.is_err() {
            tracing::warn!("Shutdown deadline exceeded, aborting remaining sessions");
            for abort in aborts {
                abort.abort();
            }
        }

        for id in self.store.ids() {
            self.store.remove(id);
        }
    }
}
