//! Status aggregation.
//!
//! [`next_status`] is the pure transition from a previous status and a new
//! probe result. [`Aggregator`] owns the per-server state around it: it
//! persists each result and status, publishes the update to the hub, and
//! runs [`StatusHook`]s when a server changes state.

mod aggregator;
mod hooks;
mod transition;

pub use aggregator::*;
pub use hooks::*;
pub use transition::*;

#[cfg(test)]
pub(crate) use hooks::testing;
