//! Core domain types for Gradebus.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. Everything here can be used from any layer of the pipeline.

mod address;
mod ids;
mod request;
mod schedule;
mod schema;
mod verification;

pub use address::{process_address, verify_address, SCHEDULE_ADDRESS};
pub use ids::{DiagnosticId, EntityId};
pub use request::{EntityRef, VerifyRequest};
pub use schedule::ScheduledMessage;
pub use schema::{EntityKind, EntityRecord, ForeignKey, Schema, SchemaError};
pub use verification::{merge, VerificationData, VerificationStatus};
