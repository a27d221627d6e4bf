//! The fixed set of read-only queries run every poll cycle

use thiserror::Error;
use tracing::warn;

use crate::fusion::field::{server_fields, ship_fields, FieldValue};
use crate::fusion::lifecycle::ShipListing;

/// Player ship slots scanned by the enumeration query
pub const MAX_PLAYER_SHIPS: u32 = 32;

/// Query result that could not be turned into a value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected}, got '{raw}'")]
    Unexpected { expected: &'static str, raw: String },
    #[error("malformed ship listing line '{0}'")]
    BadListing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Flag,
    Number,
    Integer,
    Text,
}

/// A server-level query
#[derive(Debug, Clone, Copy)]
pub struct ServerQuery {
    pub field: &'static str,
    pub expression: &'static str,
    pub kind: ValueKind,
}

/// A per-ship query; `getter` is called on the ship object
#[derive(Debug, Clone, Copy)]
pub struct ShipQuery {
    pub field: &'static str,
    pub getter: &'static str,
    pub kind: ValueKind,
}

/// Session probe; also serves as the reachability check for the cycle
pub const GAME_ACTIVE: ServerQuery = ServerQuery {
    field: server_fields::GAME_ACTIVE,
    expression: "return tostring(getScenarioTime() ~= nil and getPlayerShip(-1) ~= nil)",
    kind: ValueKind::Flag,
};

/// Remaining server-level queries, in execution order
pub const SERVER_QUERIES: &[ServerQuery] = &[
    ServerQuery {
        field: server_fields::SCENARIO_TIME,
        expression: "return tostring(getScenarioTime() or '')",
        kind: ValueKind::Number,
    },
    ServerQuery {
        field: server_fields::SCENARIO_NAME,
        expression: "if getScenarioName then return tostring(getScenarioName() or '') end return ''",
        kind: ValueKind::Text,
    },
    ServerQuery {
        field: server_fields::VICTORY_FACTION,
        expression: "if gameGlobalInfo and gameGlobalInfo.getVictoryFaction then \
                     return tostring(gameGlobalInfo:getVictoryFaction() or '') end return ''",
        kind: ValueKind::Text,
    },
    ServerQuery {
        field: server_fields::TOTAL_OBJECTS,
        expression: "return tostring(#getAllObjects())",
        kind: ValueKind::Integer,
    },
    ServerQuery {
        field: server_fields::ENEMY_SHIP_COUNT,
        expression: "local p = getPlayerShip(-1) if not p then return '0' end local n = 0 \
                     for _, o in ipairs(getAllObjects()) do \
                     if o.typeName == 'CpuShip' and o:isEnemy(p) then n = n + 1 end end \
                     return tostring(n)",
        kind: ValueKind::Integer,
    },
    ServerQuery {
        field: server_fields::FRIENDLY_STATION_COUNT,
        expression: "local p = getPlayerShip(-1) if not p then return '0' end local n = 0 \
                     for _, o in ipairs(getAllObjects()) do \
                     if o.typeName == 'SpaceStation' and o:isFriendly(p) then n = n + 1 end end \
                     return tostring(n)",
        kind: ValueKind::Integer,
    },
];

/// Lists `index<TAB>callsign` for every player ship, one per line
pub const SHIP_ENUMERATION: &str = "local out = {} for i = 0, 31 do local s = getPlayerShip(i) \
                                    if s then out[#out + 1] = i .. '\\t' .. s:getCallSign() end end \
                                    return table.concat(out, '\\n')";

/// Per-ship sub-battery
pub const SHIP_QUERIES: &[ShipQuery] = &[
    ShipQuery {
        field: ship_fields::HULL_POINTS,
        getter: "getHull()",
        kind: ValueKind::Number,
    },
    ShipQuery {
        field: ship_fields::HULL_MAX,
        getter: "getHullMax()",
        kind: ValueKind::Number,
    },
    ShipQuery {
        field: ship_fields::ENERGY_LEVEL,
        getter: "getEnergyLevel()",
        kind: ValueKind::Number,
    },
    ShipQuery {
        field: ship_fields::ENERGY_MAX,
        getter: "getEnergyLevelMax()",
        kind: ValueKind::Number,
    },
    ShipQuery {
        field: ship_fields::FRONT_SHIELD_LEVEL,
        getter: "getShieldLevel(0)",
        kind: ValueKind::Number,
    },
    ShipQuery {
        field: ship_fields::REAR_SHIELD_LEVEL,
        getter: "getShieldLevel(1)",
        kind: ValueKind::Number,
    },
    ShipQuery {
        field: ship_fields::SHIELDS_ACTIVE,
        getter: "getShieldsActive()",
        kind: ValueKind::Flag,
    },
    ShipQuery {
        field: ship_fields::FACTION,
        getter: "getFaction()",
        kind: ValueKind::Text,
    },
    ShipQuery {
        field: ship_fields::SHIP_TYPE,
        getter: "getTypeName()",
        kind: ValueKind::Text,
    },
    ShipQuery {
        field: ship_fields::REPUTATION,
        getter: "getReputationPoints()",
        kind: ValueKind::Number,
    },
    ShipQuery {
        field: ship_fields::ALERT_STATE,
        getter: "getAlertLevel()",
        kind: ValueKind::Text,
    },
];

/// Quote `value` as a Lua string literal
pub fn lua_string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Build a ship query guarded by the callsign, so a slot that changed hands
/// since enumeration yields an empty result instead of another ship's data
pub fn ship_expression(listing: &ShipListing, query: &ShipQuery) -> String {
    format!(
        "local s = getPlayerShip({}) if s and s:getCallSign() == {} then return tostring(s:{}) end return ''",
        listing.index,
        lua_string_literal(&listing.callsign),
        query.getter
    )
}

/// Parse a scalar result. An empty result means "no data".
pub fn parse_value(kind: ValueKind, raw: &str) -> Result<Option<FieldValue>, ParseError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "nil" {
        return Ok(None);
    }

    let unexpected = |expected: &'static str| ParseError::Unexpected {
        expected,
        raw: raw.to_string(),
    };

    match kind {
        ValueKind::Flag => match raw {
            "true" | "1" => Ok(Some(FieldValue::Flag(true))),
            "false" | "0" => Ok(Some(FieldValue::Flag(false))),
            _ => Err(unexpected("boolean")),
        },
        ValueKind::Number => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| Some(FieldValue::Number(v)))
            .ok_or_else(|| unexpected("number")),
        ValueKind::Integer => {
            if let Ok(v) = raw.parse::<i64>() {
                return Ok(Some(FieldValue::Integer(v)));
            }
            // Lua 5.3 may render integral floats as "3.0"
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && v.fract() == 0.0)
                .map(|v| Some(FieldValue::Integer(v as i64)))
                .ok_or_else(|| unexpected("integer"))
        }
        ValueKind::Text => Ok(Some(FieldValue::Text(raw.to_string()))),
    }
}

/// Parse the enumeration result into listings.
///
/// Malformed lines are skipped with a warning. Only a result with no
/// readable line at all is an error, so garbage never reads as "no ships".
pub fn parse_ship_listing(raw: &str) -> Result<Vec<ShipListing>, ParseError> {
    let mut listing = Vec::new();
    let mut first_bad = None;

    for line in raw.lines().map(|line| line.trim_end_matches('\r')) {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = line
            .split_once('\t')
            .and_then(|(index, callsign)| Some((index.trim().parse::<u32>().ok()?, callsign)));
        match parsed {
            Some((index, callsign)) => listing.push(ShipListing::new(index, callsign)),
            None => {
                warn!("Skipping malformed ship listing line '{}'", line);
                if first_bad.is_none() {
                    first_bad = Some(line.to_string());
                }
            }
        }
    }

    match first_bad {
        Some(line) if listing.is_empty() => Err(ParseError::BadListing(line)),
        _ => Ok(listing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_value(ValueKind::Flag, "true"), Ok(Some(FieldValue::Flag(true))));
        assert_eq!(parse_value(ValueKind::Number, " 12.5\n"), Ok(Some(FieldValue::Number(12.5))));
        assert_eq!(parse_value(ValueKind::Integer, "7"), Ok(Some(FieldValue::Integer(7))));
        assert_eq!(parse_value(ValueKind::Integer, "7.0"), Ok(Some(FieldValue::Integer(7))));
        assert_eq!(parse_value(ValueKind::Text, "Human Navy"), Ok(Some(FieldValue::Text("Human Navy".into()))));
    }

    #[test]
    fn test_empty_means_no_data() {
        assert_eq!(parse_value(ValueKind::Number, ""), Ok(None));
        assert_eq!(parse_value(ValueKind::Flag, "nil"), Ok(None));
    }

    #[test]
    fn test_unparseable_values() {
        assert!(parse_value(ValueKind::Flag, "maybe").is_err());
        assert!(parse_value(ValueKind::Number, "inf").is_err());
        assert!(parse_value(ValueKind::Integer, "2.5").is_err());
    }

    #[test]
    fn test_parse_ship_listing() {
        let listing = parse_ship_listing("0\tAlpha\r\n3\tBeta Two\n\n").unwrap();
        assert_eq!(listing, vec![ShipListing::new(0, "Alpha"), ShipListing::new(3, "Beta Two")]);
        assert_eq!(parse_ship_listing(""), Ok(vec![]));
        assert!(parse_ship_listing("Alpha").is_err());
        assert!(parse_ship_listing("x\tAlpha").is_err());
    }

    #[test]
    fn test_bad_listing_line_is_skipped() {
        let listing = parse_ship_listing("0\tAlpha\ngarbage\n2\t Beta \n").unwrap();
        assert_eq!(listing, vec![ShipListing::new(0, "Alpha"), ShipListing::new(2, " Beta ")]);
    }

    #[test]
    fn test_ship_expression_escapes_callsign() {
        let listing = ShipListing::new(2, "O'Neil\\");
        let expr = ship_expression(&listing, &SHIP_QUERIES[0]);
        assert_eq!(
            expr,
            "local s = getPlayerShip(2) if s and s:getCallSign() == 'O\\'Neil\\\\' then return tostring(s:getHull()) end return ''"
        );
    }

    #[test]
    fn test_battery_fields_unique() {
        let mut fields: Vec<&str> = std::iter::once(GAME_ACTIVE.field)
            .chain(SERVER_QUERIES.iter().map(|q| q.field))
            .chain(SHIP_QUERIES.iter().map(|q| q.field))
            .collect();
        let total = fields.len();
        fields.sort_unstable();
        fields.dedup();
        assert_eq!(fields.len(), total);
    }
}
