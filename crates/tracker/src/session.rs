//! Async driver for one tracking session.
//!
//! A session is a single tokio task running one `tokio::select!` loop.
//! Every suspension point is a branch of that loop: cancellation, the
//! overall deadline, commands from the owner, a pending channel open,
//! the next inbound frame, the heartbeat tick, the reconnect timer and
//! the poll tick. Session state is therefore only ever touched by this
//! task.
//!
//! The [`Supervisor`] decides what happens on connection events, the
//! [`EventInterpreter`] folds progress, and the [`CompletionGate`]
//! makes completion exactly-once. Observer callbacks are skipped once
//! the session's cancellation token has fired.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use afe_core::rubric::Rubric;
use afe_core::types::{JobId, LectureNo};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::JobApi;
use crate::client::{Channel, Transport, TransportError};
use crate::config::TrackerConfig;
use crate::error::TrackError;
use crate::events::TrackingObserver;
use crate::gate::{CompletionGate, GateOutcome};
use crate::interpreter::{EvaluationSnapshot, EventInterpreter, Interpretation};
use crate::messages::{parse_message, OutboundFrame, ProgressEvent};
use crate::polling::{PollStep, PollingFallback};
use crate::supervisor::{ChannelId, DropAction, Supervisor};

/// Upper bound on a graceful channel close during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What to track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingRequest {
    pub job_id: JobId,
    pub course_id: String,
    pub rubric: Rubric,
    /// Lecture the job is expected to produce. Used to fetch the stored
    /// result when a polled status does not name one.
    pub lecture_no: Option<LectureNo>,
}

impl TrackingRequest {
    pub fn new(job_id: impl Into<JobId>, course_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            course_id: course_id.into(),
            rubric: Rubric::default(),
            lecture_no: None,
        }
    }

    pub fn with_rubric(mut self, rubric: Rubric) -> Self {
        self.rubric = rubric;
        self
    }

    pub fn with_lecture(mut self, lecture_no: LectureNo) -> Self {
        self.lecture_no = Some(lecture_no);
        self
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(EvaluationSnapshot),
    Failed(TrackError),
    Cancelled,
}

/// Requests the owner can make of a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Drop whatever channel or polling loop is active, refill the
    /// reconnect budget and subscribe again. The session, its snapshot
    /// and its observer carry on.
    Reattach,
}

/// Everything a session needs from its owner.
pub struct SessionContext {
    pub request: TrackingRequest,
    pub config: Arc<TrackerConfig>,
    pub transport: Arc<dyn Transport>,
    pub api: Arc<dyn JobApi>,
    pub observer: Arc<dyn TrackingObserver>,
    pub cancel: CancellationToken,
    /// The job's completion gate, shared with any session that replaces
    /// this one.
    pub gate: Arc<CompletionGate>,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
}

/// Track one job until it completes, fails, times out or is cancelled.
pub async fn run_session(ctx: SessionContext) -> SessionOutcome {
    TrackingSession::new(ctx).run().await
}

type OpenFuture = BoxFuture<'static, Result<Box<dyn Channel>, TransportError>>;

struct TrackingSession {
    ctx: SessionContext,
    supervisor: Supervisor,
    interpreter: EventInterpreter,
    started: Instant,
    deadline: Instant,
    pending_open: Option<(ChannelId, OpenFuture)>,
    channel: Option<(ChannelId, Box<dyn Channel>)>,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Instant>,
    polling: Option<PollingFallback>,
}

impl TrackingSession {
    fn new(ctx: SessionContext) -> Self {
        let started = Instant::now();
        let deadline = started + ctx.config.tracking_timeout;
        Self {
            supervisor: Supervisor::new(ctx.config.reconnect.clone()),
            interpreter: EventInterpreter::new(ctx.request.rubric.clone()),
            started,
            deadline,
            pending_open: None,
            channel: None,
            heartbeat: None,
            reconnect_at: None,
            polling: None,
            ctx,
        }
    }

    fn job_id(&self) -> &str {
        &self.ctx.request.job_id
    }

    async fn run(mut self) -> SessionOutcome {
        tracing::info!(job_id = %self.job_id(), course_id = %self.ctx.request.course_id, "Tracking started");

        if let Some(id) = self.supervisor.start() {
            self.emit_state();
            self.begin_open(id);
        }

        loop {
            let step = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    ControlFlow::Break(self.cancelled().await)
                }
                _ = sleep_until(self.deadline) => {
                    ControlFlow::Break(self.timed_out().await)
                }
                command = next_command(&mut self.ctx.commands) => {
                    match command {
                        SessionCommand::Reattach => self.reattach().await,
                    }
                    ControlFlow::Continue(())
                }
                (id, result) = wait_open(&mut self.pending_open) => {
                    self.pending_open = None;
                    self.on_open_result(id, result).await;
                    ControlFlow::Continue(())
                }
                (id, frame) = recv_frame(&mut self.channel) => {
                    self.on_frame(id, frame).await
                }
                _ = heartbeat_tick(&mut self.heartbeat) => {
                    self.send_heartbeat().await;
                    ControlFlow::Continue(())
                }
                _ = reconnect_due(self.reconnect_at) => {
                    self.reconnect_at = None;
                    if let Some(id) = self.supervisor.on_reconnect_due() {
                        self.emit_state();
                        self.begin_open(id);
                    }
                    ControlFlow::Continue(())
                }
                _ = poll_tick(&mut self.polling) => {
                    self.poll_once().await
                }
            };

            if let ControlFlow::Break(outcome) = step {
                tracing::info!(job_id = %self.job_id(), outcome = outcome_name(&outcome), "Tracking finished");
                return outcome;
            }
        }
    }

    // ---- channel handling ----

    fn begin_open(&mut self, id: ChannelId) {
        let transport = Arc::clone(&self.ctx.transport);
        let job_id = self.ctx.request.job_id.clone();

        let open: OpenFuture = Box::pin(async move {
            let mut channel = transport.open().await?;
            channel.send(OutboundFrame::JobId(job_id)).await?;
            Ok(channel)
        });
        self.pending_open = Some((id, open));
    }

    async fn on_open_result(
        &mut self,
        id: ChannelId,
        result: Result<Box<dyn Channel>, TransportError>,
    ) {
        match result {
            Ok(mut channel) => {
                if !self.supervisor.on_open(id) {
                    channel.close().await;
                    return;
                }
                tracing::info!(job_id = %self.job_id(), "Progress channel open");

                let period = self.ctx.config.heartbeat_interval;
                let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(heartbeat);
                self.channel = Some((id, channel));
                self.emit_state();
            }
            Err(e) => {
                self.warn_transport(&e.to_string());
                self.on_drop(id).await;
            }
        }
    }

    async fn on_frame(
        &mut self,
        id: ChannelId,
        frame: Option<Result<String, TransportError>>,
    ) -> ControlFlow<SessionOutcome> {
        let text = match frame {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                self.warn_transport(&e.to_string());
                self.on_drop(id).await;
                return ControlFlow::Continue(());
            }
            None => {
                self.warn_transport("channel closed unexpectedly");
                self.on_drop(id).await;
                return ControlFlow::Continue(());
            }
        };

        let event = match parse_message(&text) {
            Ok(ProgressEvent::Heartbeat) => return ControlFlow::Continue(()),
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id(), error = %e, "Discarding malformed progress frame");
                return ControlFlow::Continue(());
            }
        };

        match self.interpreter.apply(event) {
            Interpretation::Updated => {
                self.emit_update();
                ControlFlow::Continue(())
            }
            Interpretation::Ignored => ControlFlow::Continue(()),
            Interpretation::Completed => ControlFlow::Break(self.complete().await),
            Interpretation::Failed(message) => {
                let error = TrackError::JobFailure {
                    job_id: self.ctx.request.job_id.clone(),
                    message,
                };
                ControlFlow::Break(self.fail(error).await)
            }
        }
    }

    /// A channel failed to open or closed: hand the decision to the
    /// supervisor.
    async fn on_drop(&mut self, id: ChannelId) {
        if matches!(&self.channel, Some((live, _)) if *live == id) {
            if let Some((_, mut channel)) = self.channel.take() {
                channel.close().await;
            }
            self.heartbeat = None;
        }

        match self.supervisor.on_drop(id) {
            DropAction::Ignore => {}
            DropAction::ScheduleReconnect { attempt, delay } => {
                tracing::info!(
                    job_id = %self.job_id(),
                    attempt = attempt + 1,
                    max_attempts = self.supervisor.budget().max(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect",
                );
                self.reconnect_at = Some(Instant::now() + delay);
                self.emit_state();
            }
            DropAction::StartPolling => {
                tracing::warn!(
                    job_id = %self.job_id(),
                    attempts = self.supervisor.budget().attempts(),
                    "Reconnect budget exhausted, falling back to polling",
                );
                self.polling = Some(PollingFallback::new(
                    self.ctx.request.job_id.clone(),
                    self.ctx.request.course_id.clone(),
                    self.ctx.request.lecture_no,
                    self.ctx.config.poll_interval,
                ));
                self.emit_state();
            }
        }
    }

    /// Resubscribe from scratch on the owner's request.
    async fn reattach(&mut self) {
        let Some(id) = self.supervisor.reattach() else {
            return;
        };
        tracing::info!(job_id = %self.job_id(), "Reattaching progress channel");

        self.pending_open = None;
        self.reconnect_at = None;
        self.heartbeat = None;
        if let Some(mut polling) = self.polling.take() {
            polling.stop();
        }
        if let Some((_, mut channel)) = self.channel.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await.is_err() {
                tracing::debug!(job_id = %self.job_id(), "Timed out closing progress channel");
            }
        }

        self.emit_state();
        self.begin_open(id);
    }

    async fn send_heartbeat(&mut self) {
        let Some((id, channel)) = self.channel.as_mut() else {
            return;
        };
        let id = *id;
        if let Err(e) = channel.send(OutboundFrame::Heartbeat).await {
            self.warn_transport(&e.to_string());
            self.on_drop(id).await;
        }
    }

    // ---- polling ----

    async fn poll_once(&mut self) -> ControlFlow<SessionOutcome> {
        let api = Arc::clone(&self.ctx.api);
        let Some(polling) = self.polling.as_mut() else {
            return ControlFlow::Continue(());
        };

        let step = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => return ControlFlow::Break(self.cancelled().await),
            _ = sleep_until(self.deadline) => return ControlFlow::Break(self.timed_out().await),
            step = polling.poll(api.as_ref()) => step,
        };

        match step {
            PollStep::Progress { report, attempt } => {
                self.interpreter.apply_polled_status(&report, attempt);
                self.emit_update();
                ControlFlow::Continue(())
            }
            PollStep::Retry(message) => {
                self.warn(TrackError::Polling {
                    job_id: self.ctx.request.job_id.clone(),
                    message,
                });
                ControlFlow::Continue(())
            }
            PollStep::Completed { stored } => {
                self.interpreter.complete_from_poll(stored);
                ControlFlow::Break(self.complete().await)
            }
            PollStep::Failed(message) => {
                let error = TrackError::JobFailure {
                    job_id: self.ctx.request.job_id.clone(),
                    message,
                };
                ControlFlow::Break(self.fail(error).await)
            }
        }
    }

    // ---- terminal paths ----

    async fn complete(&mut self) -> SessionOutcome {
        let course_id = self.ctx.request.course_id.clone();
        match self.ctx.gate.finalize_success(&course_id, self.interpreter.snapshot()) {
            GateOutcome::AlreadyFinalized => {
                self.release().await;
                return SessionOutcome::Completed(self.interpreter.snapshot().clone());
            }
            GateOutcome::SkipPersistence => {}
            GateOutcome::Persist(record) => match self.ctx.api.store_result(&record).await {
                Ok(()) => {
                    tracing::info!(job_id = %self.job_id(), lecture_no = record.lecture_no, "Evaluation stored");
                }
                Err(e) => self.warn(TrackError::Persistence {
                    job_id: self.ctx.request.job_id.clone(),
                    message: e.to_string(),
                }),
            },
        }

        self.interpreter.mark_complete();
        self.release().await;

        let snapshot = self.interpreter.snapshot().clone();
        if self.is_active() {
            self.ctx.observer.on_complete(&snapshot);
        }
        SessionOutcome::Completed(snapshot)
    }

    async fn fail(&mut self, error: TrackError) -> SessionOutcome {
        let first = self.ctx.gate.finalize_failure();
        if first {
            tracing::error!(job_id = %self.job_id(), error = %error, "Tracking failed");
            self.interpreter.mark_failed(&error.to_string());
        }
        self.release().await;
        if first && self.is_active() {
            self.ctx.observer.on_error(&error);
        }
        SessionOutcome::Failed(error)
    }

    async fn timed_out(&mut self) -> SessionOutcome {
        let error = TrackError::Timeout {
            job_id: self.ctx.request.job_id.clone(),
            elapsed: self.started.elapsed(),
        };
        self.fail(error).await
    }

    async fn cancelled(&mut self) -> SessionOutcome {
        tracing::info!(job_id = %self.job_id(), "Tracking cancelled");
        self.release().await;
        SessionOutcome::Cancelled
    }

    /// Close the channel and drop every timer. Safe to call repeatedly.
    async fn release(&mut self) {
        self.pending_open = None;
        self.heartbeat = None;
        self.reconnect_at = None;
        if let Some(mut polling) = self.polling.take() {
            polling.stop();
        }

        self.supervisor.finish();
        if let Some((_, mut channel)) = self.channel.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await.is_err() {
                tracing::debug!(job_id = %self.job_id(), "Timed out closing progress channel");
            }
        }
        self.emit_state();
    }

    // ---- observer plumbing ----

    fn is_active(&self) -> bool {
        !self.ctx.cancel.is_cancelled()
    }

    fn emit_update(&self) {
        if self.is_active() {
            self.ctx.observer.on_update(self.interpreter.snapshot());
        }
    }

    fn emit_state(&self) {
        if self.is_active() {
            self.ctx
                .observer
                .on_state_change(self.job_id(), self.supervisor.state());
        }
    }

    fn warn(&self, error: TrackError) {
        if self.is_active() {
            self.ctx.observer.on_warning(&error);
        }
    }

    fn warn_transport(&self, message: &str) {
        tracing::warn!(job_id = %self.job_id(), error = message, "Progress channel error");
        self.warn(TrackError::Transport {
            job_id: self.ctx.request.job_id.clone(),
            message: message.to_string(),
        });
    }
}

// ---- select! branch helpers: each pends forever when its slot is empty ----

async fn next_command(commands: &mut mpsc::UnboundedReceiver<SessionCommand>) -> SessionCommand {
    match commands.recv().await {
        Some(command) => command,
        None => std::future::pending().await,
    }
}

async fn wait_open(
    pending: &mut Option<(ChannelId, OpenFuture)>,
) -> (ChannelId, Result<Box<dyn Channel>, TransportError>) {
    match pending {
        Some((id, open)) => (*id, open.await),
        None => std::future::pending().await,
    }
}

async fn recv_frame(
    channel: &mut Option<(ChannelId, Box<dyn Channel>)>,
) -> (ChannelId, Option<Result<String, TransportError>>) {
    match channel {
        Some((id, channel)) => (*id, channel.recv().await),
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn reconnect_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn poll_tick(polling: &mut Option<PollingFallback>) {
    match polling {
        Some(polling) => polling.tick().await,
        None => std::future::pending().await,
    }
}

fn outcome_name(outcome: &SessionOutcome) -> &'static str {
    match outcome {
        SessionOutcome::Completed(_) => "completed",
        SessionOutcome::Failed(_) => "failed",
        SessionOutcome::Cancelled => "cancelled",
    }
}
