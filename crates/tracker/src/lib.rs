//! Job tracking client for long-running lecture evaluation jobs.
//!
//! Given a backend job id, a tracking session follows the job over a
//! WebSocket progress channel, reconnecting with exponential backoff
//! when the channel drops and falling back to HTTP status polling once
//! the reconnect budget is spent. Progress events are folded into an
//! [`EvaluationSnapshot`](interpreter::EvaluationSnapshot), and a
//! completion gate makes sure the final result is persisted and
//! reported exactly once.
//!
//! Entry point: [`JobTracker::start_tracking`](manager::JobTracker::start_tracking).

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod interpreter;
pub mod manager;
pub mod messages;
pub mod notifications;
pub mod polling;
pub mod reconnect;
pub mod session;
pub mod supervisor;
