//! `afe-watch` -- evaluate a range of lectures and follow the results.
//!
//! Starts one evaluation job per lecture on the AFE backend, tracks each
//! job over its progress WebSocket (falling back to status polling when
//! the socket keeps failing) and prints the evaluation of every lecture.
//! Lectures that already have a stored result are printed without
//! starting a job.
//!
//! # Environment variables
//!
//! | Variable            | Required | Default | Description                              |
//! |---------------------|----------|---------|------------------------------------------|
//! | `AFE_COURSE_ID`     | yes      | --      | Course whose lectures are evaluated      |
//! | `AFE_START_LECTURE` | no       | `1`     | First lecture of the range               |
//! | `AFE_END_LECTURE`   | no       | start   | Last lecture of the range (inclusive)    |
//! | `AFE_RUBRIC_PATH`   | no       | --      | JSON rubric keyed by criterion name      |
//! | `AFE_SESSION_ID`    | no       | --      | Client session; enables reconnect notifications |
//!
//! Endpoint and timing variables (`AFE_API_URL`, `AFE_POLL_INTERVAL_SECS`,
//! ...) are documented on `TrackerConfig::from_env`.

use std::sync::Arc;

use afe_core::rubric::Rubric;
use afe_core::types::LectureNo;
use afe_tracker::config::TrackerConfig;
use afe_tracker::manager::JobTracker;
use afe_tracker::notifications::NotificationListener;
use afe_watch::report;
use afe_watch::runner::{self, ConsoleObserver, RangeRequest};
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "afe_watch=info,afe_tracker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TrackerConfig::from_env().context("Invalid tracker configuration")?;
    let request = range_from_env()?;

    tracing::info!(
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        course_id = %request.course_id,
        start_lecture = request.start_lecture,
        end_lecture = request.end_lecture,
        "Starting afe-watch",
    );

    let tracker = JobTracker::connect(config.clone()).context("Failed to build HTTP client")?;

    let listener_cancel = CancellationToken::new();
    let listener_task = std::env::var("AFE_SESSION_ID").ok().map(|session_id| {
        let listener = NotificationListener::new(config.notifications_ws_url(), session_id);
        let tracker = Arc::clone(&tracker);
        let cancel = listener_cancel.clone();
        tokio::spawn(async move { listener.run(tracker, cancel).await })
    });

    let observer = Arc::new(ConsoleObserver::new());
    let result = tokio::select! {
        result = runner::evaluate_range(&tracker, &request, observer) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            None
        }
    };

    listener_cancel.cancel();
    tracker.shutdown().await;
    if let Some(task) = listener_task {
        let _ = task.await;
    }

    let Some(result) = result else {
        return Ok(());
    };
    let reports = result?;

    for lecture in &reports {
        println!("{}", report::render_snapshot(lecture.outcome.snapshot()));
    }
    print!("{}", report::render_summary(&reports));

    Ok(())
}

/// Read the lecture range and rubric from the environment.
fn range_from_env() -> anyhow::Result<RangeRequest> {
    let course_id = std::env::var("AFE_COURSE_ID").context("AFE_COURSE_ID is required")?;

    let start_lecture: LectureNo = match std::env::var("AFE_START_LECTURE") {
        Ok(v) => v.parse().context("AFE_START_LECTURE must be a positive integer")?,
        Err(_) => 1,
    };
    let end_lecture: LectureNo = match std::env::var("AFE_END_LECTURE") {
        Ok(v) => v.parse().context("AFE_END_LECTURE must be a positive integer")?,
        Err(_) => start_lecture,
    };

    let rubric = match std::env::var("AFE_RUBRIC_PATH") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read rubric {path}"))?;
            Rubric::from_json(&json).with_context(|| format!("Invalid rubric {path}"))?
        }
        Err(_) => Rubric::default(),
    };

    Ok(RangeRequest {
        course_id,
        start_lecture,
        end_lecture,
        rubric,
    })
}
