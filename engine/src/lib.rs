//! Verification pipeline and delay scheduler.
//!
//! The engine answers one question, "is this entity in a consistent,
//! usable state?", lazily and eventually-consistently over a mutable
//! dependency graph of persisted entities. Verifiers serve per-kind bus
//! addresses, fan out recursively across foreign keys, fold outcomes
//! through the status lattice, and cache settled results; the [`Timetable`]
//! re-triggers checks at arbitrary future times without blocking callers.

mod cache;
mod config;
mod prereq;
mod retry;
mod timetable;
mod verifier;

pub mod checks;

pub use cache::VerifyCache;
pub use config::{load_config, ConfigError, EngineConfig};
pub use retry::schedule_reverify;
pub use timetable::Timetable;
pub use verifier::{CheckCtx, CheckFut, DefaultCheck, EntityCheck, Verifier};

/// Failure codes carried in bus-level recipient failures.
pub mod codes {
    /// The request body did not parse.
    pub const BAD_REQUEST: i32 = 400;
    /// The handler failed internally (storage, serialization).
    pub const INTERNAL: i32 = 500;
}
