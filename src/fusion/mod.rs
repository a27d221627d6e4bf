//! State fusion
//!
//! Merges broadcast frames and poll cycles into per-entity snapshots that
//! readers can take without blocking writers for long.

pub mod coordinator;
pub mod field;
pub mod ingest;
pub mod lifecycle;
pub mod snapshot;

pub use coordinator::{FusionCoordinator, FusionSettings, SnapshotEvent};
pub use field::{FieldUpdate, FieldValue, Scope, ShipKey, SourceKind};
pub use snapshot::{EntitySnapshot, EntityState, StalenessPolicy};
