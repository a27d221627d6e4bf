//! Per-entity snapshot and staleness policy
//!
//! Snapshots are immutable once published: the coordinator clones, mutates
//! and swaps in a new `Arc<EntitySnapshot>`, so a reader holding an `Arc`
//! never sees a half-applied update.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::field::{FieldValue, Scope, SourceKind};

/// Lifecycle state of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Created, waiting for every applicable source to report
    Pending,
    Active,
    /// No applicable source is fresh
    Stale,
    /// Absent from the authoritative ship list; kept until purged
    Retired,
}

impl EntityState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityState::Pending => "pending",
            EntityState::Active => "active",
            EntityState::Stale => "stale",
            EntityState::Retired => "retired",
        }
    }
}

/// Freshness thresholds per source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub broadcast: Duration,
    pub query: Duration,
}

impl StalenessPolicy {
    pub fn threshold(&self, source: SourceKind) -> Duration {
        match source {
            SourceKind::Broadcast => self.broadcast,
            SourceKind::Query => self.query,
        }
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            broadcast: Duration::from_secs(2),
            query: Duration::from_secs(30),
        }
    }
}

/// One field value with provenance
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEntry {
    pub value: FieldValue,
    pub source: SourceKind,
    pub observed_at: Instant,
}

/// Identity details of a ship snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipIdentity {
    /// Slot index reported by the server; may change over a ship's lifetime
    pub index: u32,
    pub callsign: String,
    pub first_seen_at: Instant,
    pub last_seen_at: Instant,
}

/// Merged view of one entity
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub scope: Scope,
    pub state: EntityState,
    pub created_at: Instant,
    pub last_updated_at: Option<Instant>,
    pub identity: Option<ShipIdentity>,
    /// Bumped on every published change
    pub version: u64,
    fields: BTreeMap<String, FieldEntry>,
    last_by_source: [Option<Instant>; 2],
}

impl EntitySnapshot {
    pub fn new(scope: Scope, state: EntityState, created_at: Instant) -> Self {
        Self {
            scope,
            state,
            created_at,
            last_updated_at: None,
            identity: None,
            version: 0,
            fields: BTreeMap::new(),
            last_by_source: [None, None],
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldEntry> {
        self.fields.get(field)
    }

    pub fn value(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field).map(|entry| &entry.value)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldEntry)> {
        self.fields.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Most recent observation from `source`
    pub fn last_from(&self, source: SourceKind) -> Option<Instant> {
        self.last_by_source[source.index()]
    }

    pub fn has_reported(&self, source: SourceKind) -> bool {
        self.last_by_source[source.index()].is_some()
    }

    /// True when no source that has reported is still within its threshold.
    /// A snapshot with no data at all is stale.
    pub fn is_stale(&self, now: Instant, policy: &StalenessPolicy) -> bool {
        !SourceKind::ALL.iter().any(|&source| {
            self.last_from(source)
                .map(|at| now.saturating_duration_since(at) <= policy.threshold(source))
                .unwrap_or(false)
        })
    }

    /// Staleness of a single field against its own source threshold
    pub fn field_is_stale(&self, field: &str, now: Instant, policy: &StalenessPolicy) -> bool {
        match self.fields.get(field) {
            Some(entry) => {
                now.saturating_duration_since(entry.observed_at) > policy.threshold(entry.source)
            }
            None => true,
        }
    }

    /// Write a field. The latest write wins, whatever its observation time;
    /// per-source freshness only ever moves forward.
    pub(crate) fn record(&mut self, field: &str, value: FieldValue, source: SourceKind, observed_at: Instant) {
        self.fields.insert(
            field.to_string(),
            FieldEntry {
                value,
                source,
                observed_at,
            },
        );

        let slot = &mut self.last_by_source[source.index()];
        if slot.map_or(true, |at| at < observed_at) {
            *slot = Some(observed_at);
        }
        if self.last_updated_at.map_or(true, |at| at < observed_at) {
            self.last_updated_at = Some(observed_at);
        }
    }

    /// Serializable diagnostic view
    pub fn view(&self, now: Instant, wall_now: DateTime<Utc>, policy: &StalenessPolicy, primary: bool) -> SnapshotView {
        let fields = self
            .fields
            .iter()
            .map(|(name, entry)| {
                let age = now.saturating_duration_since(entry.observed_at);
                let observed_at = chrono::Duration::from_std(age)
                    .map(|age| wall_now - age)
                    .unwrap_or(wall_now);
                (
                    name.clone(),
                    FieldView {
                        value: entry.value.clone(),
                        source: entry.source,
                        observed_at,
                        age_ms: age.as_millis() as u64,
                        stale: age > policy.threshold(entry.source),
                    },
                )
            })
            .collect();

        SnapshotView {
            scope: self.scope.to_string(),
            state: self.state,
            stale: self.is_stale(now, policy),
            primary,
            index: self.identity.as_ref().map(|id| id.index),
            callsign: self.identity.as_ref().map(|id| id.callsign.clone()),
            version: self.version,
            fields,
        }
    }
}

/// JSON shape served on `/snapshots`
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotView {
    pub scope: String,
    pub state: EntityState,
    pub stale: bool,
    pub primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    pub version: u64,
    pub fields: BTreeMap<String, FieldView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldView {
    pub value: FieldValue,
    pub source: SourceKind,
    pub observed_at: DateTime<Utc>,
    pub age_ms: u64,
    pub stale: bool,
}
