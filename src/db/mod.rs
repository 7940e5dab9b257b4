//! Database module for pulseguard.
//!
//! Provides the data model, the durable-store interface the core depends on,
//! and its SQLite implementation with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;

/// The durable record store the scheduling core writes through.
///
/// Calls are synchronous: a write has completed when the call returns, which
/// is what lets the aggregator persist before it publishes.
pub trait DurableStore: Send + Sync {
    /// All server definitions, enabled or not.
    fn list_servers(&self) -> Result<Vec<Server>, DbError>;

    /// Append probe results in one batch.
    fn save_ping_results(&self, results: &[PingResult]) -> Result<(), DbError>;

    /// Append a single probe result.
    fn save_ping_result(&self, result: &PingResult) -> Result<(), DbError> {
        self.save_ping_results(std::slice::from_ref(result))
    }

    /// Insert or replace the current status of a server.
    ///
    /// Returns false when the server no longer exists and nothing was written.
    /// Ping results for deleted servers are dropped the same way.
    fn upsert_status(&self, status: &ServerStatus) -> Result<bool, DbError>;

    /// Current statuses, ordered by server name.
    fn query_statuses(&self, query: &StatusQuery) -> Result<Vec<StatusSnapshot>, DbError>;

    /// Probe history, newest first.
    fn query_pings(&self, query: &PingQuery) -> Result<Vec<PingSnapshot>, DbError>;
}
