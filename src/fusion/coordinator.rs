//! Fusion coordinator
//!
//! The single merge point for both sources. All mutation goes through
//! [`FusionCoordinator::apply_update`], [`FusionCoordinator::apply_poll_cycle`],
//! [`FusionCoordinator::set_broadcast_alive`] and [`FusionCoordinator::sweep`];
//! each takes the store's write lock once, mutates copy-on-write snapshots and
//! publishes change events after the lock is released.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

use super::field::{server_fields, FieldUpdate, FieldValue, Scope, ShipKey, SourceKind, UpdateScope};
use super::lifecycle::{LifecycleManager, ShipRoster, DEFAULT_ABSENCE_LIMIT};
use super::snapshot::{EntitySnapshot, EntityState, SnapshotView, StalenessPolicy};

/// Timing policy for the coordinator
#[derive(Debug, Clone)]
pub struct FusionSettings {
    pub staleness: StalenessPolicy,
    /// Pending ships become Active after this long even if a source never reported
    pub activation_grace: Duration,
    /// How long broadcast fields wait for a primary ship before being dropped
    pub primary_buffer_grace: Duration,
    /// How long Retired snapshots stay readable before being purged
    pub retired_retention: Duration,
    /// Consecutive roster absences before retirement
    pub absence_limit: u32,
    /// Consecutive "no active session" cycles before ships go Stale
    pub no_session_limit: u32,
    pub event_capacity: usize,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            staleness: StalenessPolicy::default(),
            activation_grace: Duration::from_secs(20),
            primary_buffer_grace: Duration::from_secs(5),
            retired_retention: Duration::from_secs(60),
            absence_limit: DEFAULT_ABSENCE_LIMIT,
            no_session_limit: 2,
            event_capacity: 256,
        }
    }
}

/// What the poller learned about the game session this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionObservation {
    /// Session query answered true
    Active,
    /// Session query answered false
    Inactive,
    /// Server answered with a "no active session" error
    NoSession,
    /// Session query failed for another reason
    Unknown,
}

/// Field updates gathered by one poll cycle
#[derive(Debug, Clone)]
pub struct PollBatch {
    pub completed_at: Instant,
    pub reachable: bool,
    pub session: SessionObservation,
    pub updates: Vec<FieldUpdate>,
}

impl PollBatch {
    pub fn unreachable(completed_at: Instant) -> Self {
        Self {
            completed_at,
            reachable: false,
            session: SessionObservation::Unknown,
            updates: Vec::new(),
        }
    }

    pub fn reachable(completed_at: Instant, session: SessionObservation, updates: Vec<FieldUpdate>) -> Self {
        Self {
            completed_at,
            reachable: true,
            session,
            updates,
        }
    }
}

/// Result of routing one update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(Scope),
    /// Broadcast field held until a primary ship exists
    Buffered,
    /// Unknown or retired scope
    Discarded,
}

/// Change notification for subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEvent {
    Changed(Scope),
    StateChanged { scope: Scope, state: EntityState },
    Created(ShipKey),
    Retired(ShipKey),
    Purged(ShipKey),
    PrimaryChanged(Option<ShipKey>),
}

#[derive(Default)]
struct Changes {
    events: Vec<SnapshotEvent>,
}

impl Changes {
    fn touch(&mut self, scope: &Scope) {
        let already = self
            .events
            .iter()
            .any(|event| matches!(event, SnapshotEvent::Changed(s) if s == scope));
        if !already {
            self.events.push(SnapshotEvent::Changed(scope.clone()));
        }
    }

    fn push(&mut self, event: SnapshotEvent) {
        self.events.push(event);
    }
}

struct Store {
    server: Arc<EntitySnapshot>,
    ships: HashMap<ShipKey, Arc<EntitySnapshot>>,
    retired_at: HashMap<ShipKey, Instant>,
    lifecycle: LifecycleManager,
    primary: Option<ShipKey>,
    /// Latest broadcast value per field while no primary exists
    pending_primary: HashMap<String, FieldUpdate>,
    broadcast_alive: bool,
    poll_reachable: bool,
    no_session_streak: u32,
    session_lost: bool,
}

impl Store {
    fn slot_mut(&mut self, scope: &Scope) -> Option<&mut Arc<EntitySnapshot>> {
        match scope {
            Scope::Server => Some(&mut self.server),
            Scope::Ship(key) => self.ships.get_mut(key),
        }
    }

    fn is_live_ship(&self, key: &ShipKey) -> bool {
        self.ships
            .get(key)
            .map(|snap| snap.state != EntityState::Retired)
            .unwrap_or(false)
    }
}

/// Owns every snapshot for one remote server
pub struct FusionCoordinator {
    settings: FusionSettings,
    store: RwLock<Store>,
    events: broadcast::Sender<SnapshotEvent>,
    metrics: Arc<Metrics>,
}

impl FusionCoordinator {
    pub fn new(settings: FusionSettings, metrics: Arc<Metrics>) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let store = Store {
            server: Arc::new(EntitySnapshot::new(Scope::Server, EntityState::Pending, Instant::now())),
            ships: HashMap::new(),
            retired_at: HashMap::new(),
            lifecycle: LifecycleManager::new(settings.absence_limit),
            primary: None,
            pending_primary: HashMap::new(),
            broadcast_alive: false,
            poll_reachable: false,
            no_session_streak: 0,
            session_lost: false,
        };

        Self {
            settings,
            store: RwLock::new(store),
            events,
            metrics,
        }
    }

    pub fn settings(&self) -> &FusionSettings {
        &self.settings
    }

    /// Receive change notifications. Slow receivers may observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.events.subscribe()
    }

    // ---- mutation ----

    /// Route a single update
    pub fn apply_update(&self, update: FieldUpdate) -> ApplyOutcome {
        let mut changes = Changes::default();
        let outcome = {
            let mut store = self.store.write();
            self.apply_locked(&mut store, update, &mut changes)
        };
        self.publish(changes);
        outcome
    }

    /// Route a batch of updates under one lock. Returns how many were applied.
    pub fn apply_updates<I>(&self, updates: I) -> usize
    where
        I: IntoIterator<Item = FieldUpdate>,
    {
        let mut changes = Changes::default();
        let applied = {
            let mut store = self.store.write();
            updates
                .into_iter()
                .map(|update| self.apply_locked(&mut store, update, &mut changes))
                .filter(|outcome| matches!(outcome, ApplyOutcome::Applied(_)))
                .count()
        };
        self.publish(changes);
        applied
    }

    /// Apply one poll cycle atomically.
    ///
    /// Order: reachability, session tracking, creation of newly listed ships
    /// and primary designation, field updates, then retirement of absent
    /// ships. A `None` roster (enumeration failed) leaves the ship set untouched.
    pub fn apply_poll_cycle(&self, batch: PollBatch, roster: Option<ShipRoster>) {
        let now = batch.completed_at;
        let mut changes = Changes::default();

        {
            let mut store = self.store.write();

            store.poll_reachable = batch.reachable;
            self.write_reachability(&mut store, SourceKind::Query, now, &mut changes);

            if batch.reachable {
                self.track_session(&mut store, batch.session, now, &mut changes);

                if let Some(roster) = roster.as_ref() {
                    self.admit_roster(&mut store, roster, now, &mut changes);
                    self.designate_primary(&mut store, roster, now, &mut changes);
                }

                for update in batch.updates {
                    self.apply_locked(&mut store, update, &mut changes);
                }

                if let Some(roster) = roster.as_ref() {
                    self.retire_absent(&mut store, roster, now, &mut changes);
                }

                let keys: Vec<ShipKey> = store.ships.keys().cloned().collect();
                for key in keys {
                    self.refresh_ship_state(&mut store, &key, now, &mut changes);
                }
            }

            self.metrics
                .ships_tracked
                .store(store.lifecycle.len() as u64, Ordering::Relaxed);
        }

        self.publish(changes);
    }

    /// Record broadcast liveness and the derived reachability fields
    pub fn set_broadcast_alive(&self, alive: bool, at: Instant) {
        let mut changes = Changes::default();
        {
            let mut store = self.store.write();
            if store.broadcast_alive == alive && store.server.get(server_fields::BROADCAST_ALIVE).is_some() {
                return;
            }
            store.broadcast_alive = alive;
            self.write_reachability(&mut store, SourceKind::Broadcast, at, &mut changes);
        }
        self.publish(changes);
    }

    /// Time-driven transitions: activation grace, Active/Stale, buffer expiry, purge
    pub fn sweep(&self, now: Instant) {
        let mut changes = Changes::default();
        {
            let mut store = self.store.write();
            let policy = self.settings.staleness;

            // Server snapshot
            let server_state = store.server.state;
            let server_stale = store.server.is_stale(now, &policy);
            let next = match server_state {
                EntityState::Active if server_stale => Some(EntityState::Stale),
                EntityState::Stale if !server_stale => Some(EntityState::Active),
                _ => None,
            };
            if let Some(next) = next {
                self.set_state(&mut store, &Scope::Server, next, &mut changes);
            }

            // Ships
            let keys: Vec<ShipKey> = store.ships.keys().cloned().collect();
            for key in keys {
                let Some(snap) = store.ships.get(&key) else { continue };
                let stale = snap.is_stale(now, &policy);
                let next = match snap.state {
                    EntityState::Pending
                        if now.saturating_duration_since(snap.created_at) >= self.settings.activation_grace =>
                    {
                        debug!("Ship '{}' activated after grace period", key);
                        Some(if stale { EntityState::Stale } else { EntityState::Active })
                    }
                    EntityState::Active if stale => Some(EntityState::Stale),
                    EntityState::Stale if !stale && !store.session_lost => Some(EntityState::Active),
                    _ => None,
                };
                if let Some(next) = next {
                    self.set_state(&mut store, &Scope::Ship(key), next, &mut changes);
                }
            }

            // Broadcast fields that never found a primary
            let grace = self.settings.primary_buffer_grace;
            let before = store.pending_primary.len();
            store
                .pending_primary
                .retain(|_, update| now.saturating_duration_since(update.observed_at) <= grace);
            let expired = before - store.pending_primary.len();
            if expired > 0 {
                debug!("Discarded {} buffered broadcast fields with no primary ship", expired);
                self.metrics
                    .broadcast_buffer_expired
                    .fetch_add(expired as u64, Ordering::Relaxed);
            }

            // Purge retired snapshots past retention
            let retention = self.settings.retired_retention;
            let purge: Vec<ShipKey> = store
                .retired_at
                .iter()
                .filter(|(_, at)| now.saturating_duration_since(**at) >= retention)
                .map(|(key, _)| key.clone())
                .collect();
            for key in purge {
                store.retired_at.remove(&key);
                store.ships.remove(&key);
                debug!("Purged retired ship '{}'", key);
                changes.push(SnapshotEvent::Purged(key));
            }
        }
        self.publish(changes);
    }

    // ---- reads ----

    /// Current snapshot for a scope. Retired ships remain readable until purged.
    pub fn snapshot(&self, scope: &Scope) -> Option<Arc<EntitySnapshot>> {
        let store = self.store.read();
        match scope {
            Scope::Server => Some(store.server.clone()),
            Scope::Ship(key) => store.ships.get(key).cloned(),
        }
    }

    /// Server snapshot followed by every non-retired ship in index order
    pub fn all_snapshots(&self) -> Vec<Arc<EntitySnapshot>> {
        let store = self.store.read();
        let mut ships: Vec<Arc<EntitySnapshot>> = store
            .ships
            .values()
            .filter(|snap| snap.state != EntityState::Retired)
            .cloned()
            .collect();
        ships.sort_by(|a, b| {
            let ia = a.identity.as_ref().map(|id| id.index).unwrap_or(u32::MAX);
            let ib = b.identity.as_ref().map(|id| id.index).unwrap_or(u32::MAX);
            ia.cmp(&ib).then_with(|| a.scope.to_string().cmp(&b.scope.to_string()))
        });

        let mut all = Vec::with_capacity(ships.len() + 1);
        all.push(store.server.clone());
        all.extend(ships);
        all
    }

    pub fn server_snapshot(&self) -> Arc<EntitySnapshot> {
        self.store.read().server.clone()
    }

    /// Ship that currently receives broadcast fields
    pub fn primary(&self) -> Option<ShipKey> {
        self.store.read().primary.clone()
    }

    /// Ships tracked by the lifecycle manager (excludes retired)
    pub fn ship_count(&self) -> usize {
        self.store.read().lifecycle.len()
    }

    /// Diagnostic views of [`Self::all_snapshots`]
    pub fn snapshot_views(&self, now: Instant) -> Vec<SnapshotView> {
        let primary = self.primary();
        let wall_now = Utc::now();
        self.all_snapshots()
            .iter()
            .map(|snap| {
                let is_primary = matches!((&snap.scope, &primary), (Scope::Ship(k), Some(p)) if k == p);
                snap.view(now, wall_now, &self.settings.staleness, is_primary)
            })
            .collect()
    }

    // ---- internals (store lock held) ----

    fn apply_locked(&self, store: &mut Store, update: FieldUpdate, changes: &mut Changes) -> ApplyOutcome {
        let outcome = match update.scope.clone() {
            UpdateScope::Server => self.write_field(store, Scope::Server, update, changes),
            UpdateScope::Ship(key) => self.write_ship_field(store, key, update, changes),
            UpdateScope::Primary => match store.primary.clone() {
                Some(key) if store.is_live_ship(&key) => self.write_ship_field(store, key, update, changes),
                _ => {
                    store.pending_primary.insert(update.field.clone(), update);
                    self.metrics.broadcast_buffered.fetch_add(1, Ordering::Relaxed);
                    ApplyOutcome::Buffered
                }
            },
        };

        match &outcome {
            ApplyOutcome::Applied(_) => self.metrics.updates_applied.fetch_add(1, Ordering::Relaxed),
            ApplyOutcome::Discarded => self.metrics.updates_discarded.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        outcome
    }

    fn write_ship_field(&self, store: &mut Store, key: ShipKey, update: FieldUpdate, changes: &mut Changes) -> ApplyOutcome {
        if !store.is_live_ship(&key) {
            debug!("Discarding '{}' for unknown or retired ship '{}'", update.field, key);
            return ApplyOutcome::Discarded;
        }
        let at = update.observed_at;
        let outcome = self.write_field(store, Scope::Ship(key.clone()), update, changes);
        if matches!(outcome, ApplyOutcome::Applied(_)) {
            self.refresh_ship_state(store, &key, at, changes);
        }
        outcome
    }

    fn write_field(&self, store: &mut Store, scope: Scope, update: FieldUpdate, changes: &mut Changes) -> ApplyOutcome {
        let Some(slot) = store.slot_mut(&scope) else {
            return ApplyOutcome::Discarded;
        };
        let snap = Arc::make_mut(slot);
        snap.record(&update.field, update.value, update.source, update.observed_at);
        snap.version += 1;
        let activate_server = scope == Scope::Server && snap.state == EntityState::Pending;
        changes.touch(&scope);

        if activate_server {
            self.set_state(store, &Scope::Server, EntityState::Active, changes);
        }
        ApplyOutcome::Applied(scope)
    }

    fn write_server_value(&self, store: &mut Store, field: &str, value: FieldValue, source: SourceKind, at: Instant, changes: &mut Changes) {
        let update = FieldUpdate {
            scope: UpdateScope::Server,
            field: field.to_string(),
            value,
            source,
            observed_at: at,
        };
        self.write_field(store, Scope::Server, update, changes);
    }

    fn write_reachability(&self, store: &mut Store, source: SourceKind, at: Instant, changes: &mut Changes) {
        let (field, value) = match source {
            SourceKind::Broadcast => (server_fields::BROADCAST_ALIVE, store.broadcast_alive),
            SourceKind::Query => (server_fields::POLL_REACHABLE, store.poll_reachable),
        };
        let reachable = store.broadcast_alive || store.poll_reachable;
        self.write_server_value(store, field, value.into(), source, at, changes);
        self.write_server_value(store, server_fields::SERVER_REACHABLE, reachable.into(), source, at, changes);
    }

    fn set_state(&self, store: &mut Store, scope: &Scope, state: EntityState, changes: &mut Changes) {
        let Some(slot) = store.slot_mut(scope) else { return };
        if slot.state == state {
            return;
        }
        let snap = Arc::make_mut(slot);
        snap.state = state;
        snap.version += 1;
        changes.touch(scope);
        changes.push(SnapshotEvent::StateChanged {
            scope: scope.clone(),
            state,
        });
    }

    /// Pending -> Active once every applicable source reported; Stale -> Active on fresh data
    fn refresh_ship_state(&self, store: &mut Store, key: &ShipKey, now: Instant, changes: &mut Changes) {
        let Some(snap) = store.ships.get(key) else { return };
        let is_primary = store.primary.as_ref() == Some(key);
        let next = match snap.state {
            EntityState::Pending => {
                let needs_broadcast = is_primary && store.broadcast_alive;
                let ready = snap.has_reported(SourceKind::Query)
                    && (!needs_broadcast || snap.has_reported(SourceKind::Broadcast));
                ready.then_some(EntityState::Active)
            }
            EntityState::Stale if !store.session_lost && !snap.is_stale(now, &self.settings.staleness) => {
                Some(EntityState::Active)
            }
            _ => None,
        };
        if let Some(next) = next {
            self.set_state(store, &Scope::Ship(key.clone()), next, changes);
        }
    }

    fn track_session(&self, store: &mut Store, session: SessionObservation, now: Instant, changes: &mut Changes) {
        match session {
            SessionObservation::NoSession => {
                store.no_session_streak += 1;
                if store.no_session_streak < self.settings.no_session_limit {
                    return;
                }
                if !store.session_lost {
                    info!(
                        "No active game session for {} cycles; marking ships stale",
                        store.no_session_streak
                    );
                    store.session_lost = true;
                }
                self.write_server_value(store, server_fields::GAME_ACTIVE, false.into(), SourceKind::Query, now, changes);
                self.write_server_value(store, server_fields::GAME_STATUS, "setup".into(), SourceKind::Query, now, changes);

                let live: Vec<ShipKey> = store
                    .ships
                    .iter()
                    .filter(|(_, snap)| snap.state != EntityState::Retired)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in live {
                    self.set_state(store, &Scope::Ship(key), EntityState::Stale, changes);
                }
            }
            SessionObservation::Active | SessionObservation::Inactive => {
                if store.session_lost {
                    info!("Game session available again");
                }
                store.no_session_streak = 0;
                store.session_lost = false;
            }
            SessionObservation::Unknown => {}
        }
    }

    fn admit_roster(&self, store: &mut Store, roster: &ShipRoster, now: Instant, changes: &mut Changes) {
        let ambiguities = roster.ambiguities().len() as u64;
        if ambiguities > 0 {
            self.metrics
                .identity_ambiguities
                .fetch_add(ambiguities, Ordering::Relaxed);
        }

        let admission = store.lifecycle.admit(roster, now);

        for key in admission.created {
            let mut snap = EntitySnapshot::new(Scope::Ship(key.clone()), EntityState::Pending, now);
            snap.identity = store.lifecycle.identity(&key).cloned();
            if store.retired_at.remove(&key).is_some() {
                info!("Ship '{}' reappeared after retirement; starting a fresh snapshot", key);
            } else {
                info!("Tracking ship '{}'", key);
            }
            store.ships.insert(key.clone(), Arc::new(snap));
            self.metrics.ships_created.fetch_add(1, Ordering::Relaxed);
            changes.push(SnapshotEvent::Created(key.clone()));
            changes.touch(&Scope::Ship(key));
        }

        for (key, _, _) in admission.reindexed {
            let identity = store.lifecycle.identity(&key).cloned();
            if let Some(slot) = store.ships.get_mut(&key) {
                let snap = Arc::make_mut(slot);
                snap.identity = identity;
                snap.version += 1;
                changes.touch(&Scope::Ship(key));
            }
        }
    }

    fn retire_absent(&self, store: &mut Store, roster: &ShipRoster, now: Instant, changes: &mut Changes) {
        for key in store.lifecycle.retire_absent(roster) {
            info!("Ship '{}' left the ship list; retiring", key);
            self.set_state(store, &Scope::Ship(key.clone()), EntityState::Retired, changes);
            store.retired_at.insert(key.clone(), now);
            self.metrics.ships_retired.fetch_add(1, Ordering::Relaxed);
            changes.push(SnapshotEvent::Retired(key));
        }
    }

    fn designate_primary(&self, store: &mut Store, roster: &ShipRoster, now: Instant, changes: &mut Changes) {
        let primary = roster.primary().map(|entry| entry.key.clone());
        if primary != store.primary {
            match &primary {
                Some(key) => info!("Broadcast fields now attributed to '{}'", key),
                None => warn!("No eligible primary ship; buffering broadcast fields"),
            }
            store.primary = primary.clone();
            changes.push(SnapshotEvent::PrimaryChanged(primary.clone()));
        }

        let Some(key) = primary else { return };
        if store.pending_primary.is_empty() {
            return;
        }

        let grace = self.settings.primary_buffer_grace;
        let buffered: Vec<FieldUpdate> = store.pending_primary.drain().map(|(_, update)| update).collect();
        let mut attributed = 0usize;
        for update in buffered {
            if now.saturating_duration_since(update.observed_at) > grace {
                self.metrics.broadcast_buffer_expired.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if matches!(
                self.write_ship_field(store, key.clone(), update, changes),
                ApplyOutcome::Applied(_)
            ) {
                attributed += 1;
            }
        }
        if attributed > 0 {
            debug!("Re-attributed {} buffered broadcast fields to '{}'", attributed, key);
        }
    }

    fn publish(&self, changes: Changes) {
        if changes.events.is_empty() {
            return;
        }
        self.metrics
            .snapshot_publishes
            .fetch_add(1, Ordering::Relaxed);
        for event in changes.events {
            // No subscribers is not an error
            let _ = self.events.send(event);
        }
    }
}
