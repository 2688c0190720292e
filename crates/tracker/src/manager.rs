//! Multi-job tracking manager.
//!
//! [`JobTracker`] spawns one session task per tracked job and keeps a
//! registry of the running ones, so a session can be told to
//! resubscribe (`reattach`) after the backend asks for it, replaced when
//! the same job is tracked again, or stopped during shutdown.
//!
//! A session removes its own registry entry when its task exits. Jobs
//! whose completion gate closed (completed, failed or timed out) are
//! remembered by id only, so they are never tracked, and never
//! persisted, a second time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use afe_core::types::{JobId, Timestamp};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, HttpJobApi, JobApi};
use crate::client::{Transport, WsTransport};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::events::TrackingObserver;
use crate::gate::CompletionGate;
use crate::session::{run_session, SessionCommand, SessionContext, SessionOutcome, TrackingRequest};

/// How long to wait for a stopped session to release its channel.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracks any number of jobs, one session each.
///
/// The returned `Arc` can be cloned freely.
pub struct JobTracker {
    config: Arc<TrackerConfig>,
    transport: Arc<dyn Transport>,
    api: Arc<dyn JobApi>,
    registry: Arc<Registry>,
    next_session: AtomicU64,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
}

/// Shared with every session task so it can deregister itself.
///
/// Lock order: `sessions` before `finished`.
#[derive(Default)]
struct Registry {
    sessions: RwLock<HashMap<JobId, ManagedSession>>,
    /// Jobs whose completion gate closed.
    finished: RwLock<HashSet<JobId>>,
}

/// Registry entry for one running session.
struct ManagedSession {
    /// Distinguishes this session from one that replaced it.
    id: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    gate: Arc<CompletionGate>,
    /// Child of the master token.
    cancel: CancellationToken,
    /// Cancelled when the session task exits.
    done: CancellationToken,
}

impl ManagedSession {
    /// Cancel the session and wait (bounded) for its task to exit.
    async fn stop(&self, job_id: &str) {
        self.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, self.done.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(job_id, "Tracking session did not stop in time");
        }
    }

    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.done.is_cancelled()
    }
}

impl Registry {
    /// Called by a session task after it exited. Removes the entry unless
    /// another session has replaced it, and remembers finished jobs.
    async fn deregister(&self, job_id: &str, session: u64) {
        let mut sessions = self.sessions.write().await;
        if !sessions.get(job_id).is_some_and(|managed| managed.id == session) {
            return;
        }
        if let Some(managed) = sessions.remove(job_id) {
            if managed.gate.is_finalized() {
                self.finished.write().await.insert(job_id.to_string());
            }
        }
    }
}

/// Caller's handle on a running session.
#[derive(Debug)]
pub struct TrackingHandle {
    job_id: JobId,
    started_at: Timestamp,
    cancel: CancellationToken,
    task: JoinHandle<SessionOutcome>,
}

impl TrackingHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Stop tracking. Takes effect immediately: no observer callback
    /// fires after this returns. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end. A reattach does not end it.
    pub async fn finished(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Tracking task panicked or was aborted");
                SessionOutcome::Cancelled
            }
        }
    }
}

impl JobTracker {
    pub fn new(
        config: TrackerConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn JobApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            transport,
            api,
            registry: Arc::new(Registry::default()),
            next_session: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Build a tracker talking to the real backend.
    pub fn connect(config: TrackerConfig) -> Result<Arc<Self>, ApiError> {
        let transport = Arc::new(WsTransport::new(config.job_ws_url()));
        let api = Arc::new(HttpJobApi::new(&config.api_url, config.request_timeout)?);
        Ok(Self::new(config, transport, api))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Shared API client, for callers that also submit jobs.
    pub fn api(&self) -> Arc<dyn JobApi> {
        Arc::clone(&self.api)
    }

    /// Start tracking a job. An existing session for the same job is
    /// cancelled first, so a job never has two live channels.
    ///
    /// Fails with [`TrackerError::AlreadyFinished`] for a job that has
    /// already completed or failed, including one whose previous session
    /// finished while it was being replaced.
    pub async fn start_tracking(
        &self,
        request: TrackingRequest,
        observer: Arc<dyn TrackingObserver>,
    ) -> Result<TrackingHandle, TrackerError> {
        if self.cancel.is_cancelled() {
            return Err(TrackerError::ShutDown);
        }
        if self.registry.finished.read().await.contains(&request.job_id) {
            return Err(TrackerError::AlreadyFinished(request.job_id));
        }

        let mut sessions = self.registry.sessions.write().await;
        let gate = match sessions.remove(&request.job_id) {
            Some(previous) => {
                tracing::info!(job_id = %request.job_id, "Replacing existing tracking session");
                previous.stop(&request.job_id).await;
                if previous.gate.is_finalized() {
                    self.registry
                        .finished
                        .write()
                        .await
                        .insert(request.job_id.clone());
                    return Err(TrackerError::AlreadyFinished(request.job_id));
                }
                previous.gate
            }
            None => Arc::new(CompletionGate::new()),
        };

        let job_id = request.job_id.clone();
        let (handle, managed) = self.spawn_session(request, observer, gate);
        sessions.insert(job_id, managed);
        Ok(handle)
    }

    /// Ask the running session of a job to resubscribe: its channel (or
    /// polling loop) is dropped, the reconnect budget refilled and a new
    /// channel opened. The caller's [`TrackingHandle`] keeps following
    /// the same session.
    pub async fn reattach(&self, job_id: &str) -> Result<(), TrackerError> {
        {
            let sessions = self.registry.sessions.read().await;
            if let Some(managed) = sessions.get(job_id).filter(|managed| managed.is_running()) {
                if managed.commands.send(SessionCommand::Reattach).is_ok() {
                    tracing::info!(job_id, "Reattaching tracking session");
                    return Ok(());
                }
                if managed.gate.is_finalized() {
                    return Err(TrackerError::AlreadyFinished(job_id.to_string()));
                }
            }
        }

        if self.registry.finished.read().await.contains(job_id) {
            return Err(TrackerError::AlreadyFinished(job_id.to_string()));
        }
        Err(TrackerError::UnknownJob(job_id.to_string()))
    }

    /// Ids of jobs whose session is still running.
    pub async fn tracked_jobs(&self) -> Vec<JobId> {
        self.registry
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, managed)| managed.is_running())
            .map(|(job_id, _)| job_id.clone())
            .collect()
    }

    /// `true` once a job's completion gate has closed.
    pub async fn is_finished(&self, job_id: &str) -> bool {
        if self.registry.finished.read().await.contains(job_id) {
            return true;
        }
        self.registry
            .sessions
            .read()
            .await
            .get(job_id)
            .is_some_and(|managed| managed.gate.is_finalized())
    }

    /// Forget a job. Its session, if still running, is stopped.
    pub async fn untrack(&self, job_id: &str) {
        let removed = self.registry.sessions.write().await.remove(job_id);
        if let Some(managed) = removed {
            managed.stop(job_id).await;
        }
    }

    /// Stop every session and refuse new ones.
    ///
    /// Cancels the master token, then waits up to 5 seconds per session
    /// for a clean exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job tracker");
        self.cancel.cancel();

        let mut sessions = self.registry.sessions.write().await;
        for (job_id, managed) in sessions.drain() {
            tracing::debug!(job_id = %job_id, "Stopping tracking session");
            managed.stop(&job_id).await;
        }

        tracing::info!("Job tracker shut down complete");
    }

    // ---- private helpers ----

    fn spawn_session(
        &self,
        request: TrackingRequest,
        observer: Arc<dyn TrackingObserver>,
        gate: Arc<CompletionGate>,
    ) -> (TrackingHandle, ManagedSession) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let done = CancellationToken::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let job_id = request.job_id.clone();

        let ctx = SessionContext {
            request,
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            api: Arc::clone(&self.api),
            observer,
            cancel: cancel.clone(),
            gate: Arc::clone(&gate),
            commands: command_rx,
        };

        let registry = Arc::clone(&self.registry);
        let done_guard = done.clone().drop_guard();
        let task_job_id = job_id.clone();
        let task = tokio::spawn(async move {
            // Signal `done` before taking the registry lock: whoever is
            // stopping this session may be holding it.
            let outcome = {
                let _done = done_guard;
                run_session(ctx).await
            };
            registry.deregister(&task_job_id, id).await;
            outcome
        });

        let handle = TrackingHandle {
            job_id,
            started_at: chrono::Utc::now(),
            cancel: cancel.clone(),
            task,
        };
        let managed = ManagedSession {
            id,
            commands,
            gate,
            cancel,
            done,
        };
        (handle, managed)
    }
}
