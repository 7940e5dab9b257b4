//! PulseGuard - server health monitoring.
//!
//! Periodically probes a fleet of servers, folds the results into a rolling
//! per-server status and pushes every update to live subscribers.

pub mod config;
pub mod db;
pub mod hub;
pub mod probe;
pub mod scheduler;
pub mod status;
pub mod web;
