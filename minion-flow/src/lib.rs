//! MINION Flow - Task Flow DAGs
//!
//! Task flows are declarative YAML state machines over task statuses. This
//! crate loads them (with single-parent inheritance), validates structure,
//! and exposes the in-memory graph the task engine routes on.
//!
//! Flows can cycle (a failed stage may route back to an earlier stage); they
//! are state machines, not build graphs, so there is no topological sort.

mod loader;
mod model;

pub use loader::*;
pub use model::*;
