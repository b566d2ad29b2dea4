//! Polls Veeam Backup & Replication servers for job states.
//!
//! Each configured server gets a [`coordinator::Coordinator`] that keeps a
//! bearer token fresh, fetches the job list on an interval, normalizes it into
//! [`core::models::JobRecord`]s and publishes the result as an immutable
//! snapshot to any number of subscribers.

pub mod api;
pub mod coordinator;
pub mod core;
