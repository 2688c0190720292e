//! Shared domain types for the lecture evaluation tracking client.
//!
//! Everything here is transport-agnostic: identifiers, job status,
//! rubric definitions, wire message-type names, and the common error
//! type used for validation failures.

pub mod error;
pub mod message_types;
pub mod rubric;
pub mod types;
