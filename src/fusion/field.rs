//! Field values, scopes and the update record both sources emit

use std::fmt;
use std::time::Instant;

use serde::Serialize;

/// Server-level field names
pub mod server_fields {
    /// A game is loaded and a player ship exists
    pub const GAME_ACTIVE: &str = "game_active";
    /// setup / playing / paused / game_over_victory / game_over_defeat
    pub const GAME_STATUS: &str = "game_status";
    pub const SCENARIO_TIME: &str = "scenario_time";
    pub const SCENARIO_NAME: &str = "scenario_name";
    pub const PAUSED: &str = "paused";
    pub const VICTORY_FACTION: &str = "victory_faction";
    pub const TOTAL_OBJECTS: &str = "total_objects";
    pub const ENEMY_SHIP_COUNT: &str = "enemy_ship_count";
    pub const FRIENDLY_STATION_COUNT: &str = "friendly_station_count";
    pub const PLAYER_SHIP_COUNT: &str = "player_ship_count";
    /// Broadcast packets arrived within the liveness window
    pub const BROADCAST_ALIVE: &str = "broadcast_alive";
    /// Last poll cycle reached the query endpoint
    pub const POLL_REACHABLE: &str = "poll_reachable";
    /// broadcast_alive OR poll_reachable
    pub const SERVER_REACHABLE: &str = "server_reachable";
}

/// Per-ship field names produced by the query sub-battery.
/// Broadcast channel names are camelCase and never collide with these.
pub mod ship_fields {
    pub const HULL_POINTS: &str = "hull_points";
    pub const HULL_MAX: &str = "hull_max";
    pub const ENERGY_LEVEL: &str = "energy_level";
    pub const ENERGY_MAX: &str = "energy_max";
    pub const FRONT_SHIELD_LEVEL: &str = "front_shield_level";
    pub const REAR_SHIELD_LEVEL: &str = "rear_shield_level";
    pub const SHIELDS_ACTIVE: &str = "shields_active";
    pub const FACTION: &str = "faction";
    pub const SHIP_TYPE: &str = "ship_type";
    pub const REPUTATION: &str = "reputation";
    pub const ALERT_STATE: &str = "alert_state";
}

/// A typed scalar
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Integer(i64),
    Flag(bool),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Flag(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Flag(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Which channel produced a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Broadcast,
    Query,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Broadcast, SourceKind::Query];

    pub(crate) fn index(self) -> usize {
        match self {
            SourceKind::Broadcast => 0,
            SourceKind::Query => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Broadcast => "broadcast",
            SourceKind::Query => "query",
        }
    }
}

/// Externally durable ship identifier, derived from the callsign
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ShipKey(String);

impl ShipKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShipKey {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

/// Identity a snapshot belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Server,
    Ship(ShipKey),
}

impl Scope {
    pub fn ship(key: impl Into<String>) -> Self {
        Scope::Ship(ShipKey::new(key))
    }

    pub fn ship_key(&self) -> Option<&ShipKey> {
        match self {
            Scope::Ship(key) => Some(key),
            Scope::Server => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Server => f.write_str("server"),
            Scope::Ship(key) => write!(f, "ship:{key}"),
        }
    }
}

/// Scope carried by an update. Broadcast fields cannot name a ship and
/// target whichever ship the coordinator designates as primary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpdateScope {
    Server,
    Primary,
    Ship(ShipKey),
}

impl From<Scope> for UpdateScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Server => UpdateScope::Server,
            Scope::Ship(key) => UpdateScope::Ship(key),
        }
    }
}

/// One observed field value on its way into the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub scope: UpdateScope,
    pub field: String,
    pub value: FieldValue,
    pub source: SourceKind,
    pub observed_at: Instant,
}

impl FieldUpdate {
    /// Broadcast field for the primary ship
    pub fn broadcast(field: impl Into<String>, value: impl Into<FieldValue>, observed_at: Instant) -> Self {
        Self {
            scope: UpdateScope::Primary,
            field: field.into(),
            value: value.into(),
            source: SourceKind::Broadcast,
            observed_at,
        }
    }

    /// Query field for an explicit scope
    pub fn query(
        scope: Scope,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
        observed_at: Instant,
    ) -> Self {
        Self {
            scope: scope.into(),
            field: field.into(),
            value: value.into(),
            source: SourceKind::Query,
            observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_accessors() {
        assert_eq!(FieldValue::from(0.5).as_f64(), Some(0.5));
        assert_eq!(FieldValue::from(3i64).as_f64(), Some(3.0));
        assert_eq!(FieldValue::from(true).as_bool(), Some(true));
        assert_eq!(FieldValue::from("Human Navy").as_str(), Some("Human Navy"));
        assert_eq!(FieldValue::from("x").as_f64(), None);
    }

    #[test]
    fn test_field_value_json_is_untagged() {
        let json = serde_json::to_string(&FieldValue::from(true)).unwrap();
        assert_eq!(json, "true");
        let json = serde_json::to_string(&FieldValue::from("red")).unwrap();
        assert_eq!(json, "\"red\"");
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(Scope::Server.to_string(), "server");
        assert_eq!(Scope::ship("Alpha").to_string(), "ship:Alpha");
    }

    #[test]
    fn test_update_constructors() {
        let now = Instant::now();
        let b = FieldUpdate::broadcast("hull", 0.4, now);
        assert_eq!(b.scope, UpdateScope::Primary);
        assert_eq!(b.source, SourceKind::Broadcast);

        let q = FieldUpdate::query(Scope::ship("Alpha"), "faction", "Human Navy", now);
        assert_eq!(q.scope, UpdateScope::Ship(ShipKey::from("Alpha")));
        assert_eq!(q.source, SourceKind::Query);
    }
}
