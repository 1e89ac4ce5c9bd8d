//! SQLite-backed persistence for MatterStack runs.
//!
//! One [`StateStore`] per run: a single `state.db` file plus a sibling
//! `run.lock` advisory lock. The store is the only shared mutable resource in
//! the system; every mutation goes through a transaction on one connection,
//! and the engine holds the run lock for the duration of a tick.
//!
//! Operations are grouped by concern into submodules (`runs`, `tasks`,
//! `attempts`, `external`, `events`), each extending the same `StateStore`
//! type. The external contract is one type.

mod attempts;
mod events;
mod external;
mod lock;
mod records;
mod runs;
mod schema;
mod store;
mod tasks;

pub use attempts::{AttemptUpdate, NewAttempt};
pub use lock::RunLock;
pub use records::{
    AttemptRecord, EventRecord, ExternalRunRecord, RunRecord, TaskRow,
};
pub use schema::CURRENT_SCHEMA_VERSION;
pub use store::{StateStore, StoreError};
