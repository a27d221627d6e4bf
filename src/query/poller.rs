//! Periodic query battery
//!
//! One cycle runs the session probe, the server queries, the ship
//! enumeration and the per-ship sub-battery, then hands the whole batch to
//! the coordinator in one step. A transport failure anywhere aborts the rest
//! of the cycle; other query errors only cost the affected field.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::fusion::coordinator::{FusionCoordinator, PollBatch, SessionObservation};
use crate::fusion::field::{server_fields, FieldUpdate, FieldValue, Scope};
use crate::fusion::lifecycle::{ShipListing, ShipRoster};
use crate::metrics::Metrics;
use crate::util::shutdown::Shutdown;

use super::battery::{
    parse_ship_listing, parse_value, ship_expression, ValueKind, GAME_ACTIVE, SERVER_QUERIES, SHIP_ENUMERATION,
    SHIP_QUERIES,
};
use super::client::{QueryError, QueryTransport};
use super::clock::{GameStatus, ScenarioClock};

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

pub struct QueryPoller<T> {
    transport: T,
    coordinator: Arc<FusionCoordinator>,
    settings: PollerSettings,
    metrics: Arc<Metrics>,
    clock: ScenarioClock,
    unreachable_streak: u32,
}

impl<T: QueryTransport> QueryPoller<T> {
    pub fn new(
        transport: T,
        coordinator: Arc<FusionCoordinator>,
        settings: PollerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transport,
            coordinator,
            settings,
            metrics,
            clock: ScenarioClock::new(),
            unreachable_streak: 0,
        }
    }

    /// Consecutive cycles that failed at the transport level
    pub fn unreachable_streak(&self) -> u32 {
        self.unreachable_streak
    }

    /// Run one full cycle without touching the coordinator
    pub async fn poll_once(&mut self) -> (PollBatch, Option<ShipRoster>) {
        let started = Instant::now();
        let result = self.collect().await;
        self.metrics.record_poll_duration(started.elapsed());
        result
    }

    /// Run one cycle and apply it
    pub async fn run_cycle(&mut self) {
        let (batch, roster) = self.poll_once().await;
        self.metrics.poll_cycles.fetch_add(1, Ordering::Relaxed);
        self.coordinator.apply_poll_cycle(batch, roster);
    }

    /// Poll every interval until shutdown. An in-flight cycle is abandoned.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Query poller started (every {:?})", self.settings.interval);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = self.run_cycle() => {}
                    }
                }
            }
        }

        info!("Query poller stopped");
    }

    async fn collect(&mut self) -> (PollBatch, Option<ShipRoster>) {
        let mut updates = Vec::new();

        let session = match self.query(GAME_ACTIVE.expression).await {
            Err(e) if e.is_transport() => {
                self.note_unreachable(&e);
                return (PollBatch::unreachable(Instant::now()), None);
            }
            Err(e) if e.is_no_session() => {
                self.note_reachable();
                debug!("No game session: {}", e);
                self.clock.observe(None, Instant::now());
                // Every other query would fail the same way
                return (
                    PollBatch::reachable(Instant::now(), SessionObservation::NoSession, updates),
                    None,
                );
            }
            Err(e) => {
                debug!("Session probe failed: {}", e);
                SessionObservation::Unknown
            }
            Ok(raw) => match self.parse(GAME_ACTIVE.kind, &raw, GAME_ACTIVE.field) {
                Some(FieldValue::Flag(active)) => {
                    updates.push(FieldUpdate::query(Scope::Server, GAME_ACTIVE.field, active, Instant::now()));
                    if active {
                        SessionObservation::Active
                    } else {
                        SessionObservation::Inactive
                    }
                }
                _ => SessionObservation::Unknown,
            },
        };
        self.note_reachable();

        let mut aborted = false;
        let mut scenario_time = None;
        let mut victory_faction = None;

        for query in SERVER_QUERIES {
            match self.query(query.expression).await {
                Ok(raw) => {
                    let Some(value) = self.parse(query.kind, &raw, query.field) else {
                        continue;
                    };
                    if query.field == server_fields::SCENARIO_TIME {
                        scenario_time = value.as_f64();
                    } else if query.field == server_fields::VICTORY_FACTION {
                        victory_faction = value.as_str().map(str::to_string);
                    }
                    updates.push(FieldUpdate::query(Scope::Server, query.field, value, Instant::now()));
                }
                Err(e) if e.is_transport() => {
                    warn!("Lost query connection mid-cycle: {}", e);
                    aborted = true;
                    break;
                }
                Err(e) => debug!("Query '{}' failed: {}", query.field, e),
            }
        }

        let now = Instant::now();
        if !aborted {
            if let Some(paused) = self.clock.observe(scenario_time, now) {
                updates.push(FieldUpdate::query(Scope::Server, server_fields::PAUSED, paused, now));
            }
        }
        if let SessionObservation::Active | SessionObservation::Inactive = session {
            let status = GameStatus::derive(
                session == SessionObservation::Active,
                self.clock.is_paused(),
                victory_faction.as_deref(),
            );
            updates.push(FieldUpdate::query(Scope::Server, server_fields::GAME_STATUS, status.as_str(), now));
        }

        if aborted {
            return (PollBatch::reachable(Instant::now(), session, updates), None);
        }

        let roster = match self.query(SHIP_ENUMERATION).await {
            Ok(raw) => match parse_ship_listing(&raw) {
                Ok(listing) => Some(ShipRoster::from_listing(listing)),
                Err(e) => {
                    self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Unreadable ship listing: {}", e);
                    None
                }
            },
            Err(e) => {
                if e.is_transport() {
                    warn!("Lost query connection during ship enumeration: {}", e);
                    aborted = true;
                } else {
                    debug!("Ship enumeration failed: {}", e);
                }
                None
            }
        };

        if let Some(roster) = roster.as_ref() {
            updates.push(FieldUpdate::query(
                Scope::Server,
                server_fields::PLAYER_SHIP_COUNT,
                roster.len() as i64,
                Instant::now(),
            ));

            'ships: for entry in roster.entries() {
                let listing = ShipListing::new(entry.index, entry.reported_callsign.clone());
                for query in SHIP_QUERIES {
                    match self.query(&ship_expression(&listing, query)).await {
                        Ok(raw) => {
                            if let Some(value) = self.parse(query.kind, &raw, query.field) {
                                updates.push(FieldUpdate::query(
                                    Scope::Ship(entry.key.clone()),
                                    query.field,
                                    value,
                                    Instant::now(),
                                ));
                            }
                        }
                        Err(e) if e.is_transport() => {
                            warn!("Lost query connection while reading '{}': {}", entry.key, e);
                            aborted = true;
                            break 'ships;
                        }
                        Err(e) => debug!("Query '{}' for '{}' failed: {}", query.field, entry.key, e),
                    }
                }
            }
        }

        if aborted {
            debug!("Publishing partial poll cycle ({} updates)", updates.len());
        }

        (PollBatch::reachable(Instant::now(), session, updates), roster)
    }

    async fn query(&self, expression: &str) -> Result<String, QueryError> {
        let result = self.transport.evaluate(expression).await;
        let counter = match &result {
            Ok(_) => &self.metrics.queries_ok,
            Err(QueryError::Transport(_)) => &self.metrics.queries_transport_error,
            Err(QueryError::NoSession(_)) => &self.metrics.queries_no_session,
            Err(QueryError::Evaluation(_)) => &self.metrics.queries_eval_error,
            Err(QueryError::Http { .. }) => &self.metrics.queries_http_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn parse(&self, kind: ValueKind, raw: &str, field: &str) -> Option<FieldValue> {
        match parse_value(kind, raw) {
            Ok(value) => value,
            Err(e) => {
                self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Field '{}': {}", field, e);
                None
            }
        }
    }

    fn note_unreachable(&mut self, error: &QueryError) {
        self.unreachable_streak += 1;
        self.metrics.poll_unreachable.fetch_add(1, Ordering::Relaxed);
        self.metrics.poll_reachable.store(0, Ordering::Relaxed);
        self.clock.observe(None, Instant::now());

        if self.unreachable_streak == 1 {
            warn!("Game server unreachable: {}", error);
        } else {
            debug!("Game server still unreachable ({} cycles): {}", self.unreachable_streak, error);
        }
    }

    fn note_reachable(&mut self) {
        if self.unreachable_streak > 0 {
            info!("Game server reachable again after {} failed cycles", self.unreachable_streak);
        }
        self.unreachable_streak = 0;
        self.metrics.poll_reachable.store(1, Ordering::Relaxed);
    }
}
