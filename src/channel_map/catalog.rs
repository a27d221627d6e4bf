//! Variables the broadcaster can put on a channel

use super::RuleKind;

/// One broadcastable variable.
///
/// `input`, `min_input` and `max_input` describe the game-side value the
/// broadcaster samples; it scales that range to `min_output..max_output` of a
/// full channel. `rule` turns the raw channel byte back into a field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub input: &'static str,
    pub min_input: f64,
    pub max_input: f64,
    pub min_output: f64,
    pub max_output: f64,
    pub rule: RuleKind,
}

const fn linear(
    name: &'static str,
    input: &'static str,
    min_input: f64,
    max_input: f64,
    min_out: f64,
    max_out: f64,
) -> CatalogEntry {
    CatalogEntry {
        name,
        input,
        min_input,
        max_input,
        min_output: 0.0,
        max_output: 1.0,
        rule: RuleKind::Linear { min_out, max_out },
    }
}

const fn flag(name: &'static str, input: &'static str) -> CatalogEntry {
    CatalogEntry {
        name,
        input,
        min_input: 0.0,
        max_input: 1.0,
        min_output: 0.0,
        max_output: 1.0,
        rule: RuleKind::Boolean { threshold: 128 },
    }
}

/// Alert level broadcast as 0 (normal), 1 (yellow), 2 (red)
pub const ALERT_LEVELS: &[(u8, u8, &str)] = &[(0, 63, "normal"), (64, 191, "yellow"), (192, 255, "red")];

/// Every known variable, in canonical channel order
pub const CATALOG: &[CatalogEntry] = &[
    linear("hull", "Hull", 0.0, 100.0, 0.0, 1.0),
    linear("frontShield", "Shield0", 0.0, 100.0, 0.0, 1.0),
    linear("rearShield", "Shield1", 0.0, 100.0, 0.0, 1.0),
    linear("energy", "Energy", 0.0, 100.0, 0.0, 1.0),
    flag("redAlert", "RedAlert"),
    flag("yellowAlert", "YellowAlert"),
    flag("shieldsUp", "ShieldsUp"),
    flag("docked", "Docked"),
    flag("docking", "Docking"),
    flag("hasShip", "HasShip"),
    linear("impulse", "Impulse", -1.0, 1.0, -1.0, 1.0),
    linear("warp", "Warp", 0.0, 4.0, 0.0, 4.0),
    CatalogEntry {
        name: "alertLevel",
        input: "Alert",
        min_input: 0.0,
        max_input: 2.0,
        min_output: 0.0,
        max_output: 1.0,
        rule: RuleKind::Enum(ALERT_LEVELS),
    },
    flag("inNebula", "InNebula"),
    flag("jumping", "Jumping"),
    flag("selfDestruct", "SelfDestruct"),
];

/// Selection used when none is configured
pub const DEFAULT_SELECTION: &[&str] = &[
    "hull",
    "frontShield",
    "rearShield",
    "energy",
    "redAlert",
    "yellowAlert",
    "shieldsUp",
    "docked",
    "docking",
    "hasShip",
    "impulse",
    "warp",
];

/// Find a variable by field name or broadcaster input name (case-insensitive)
pub fn lookup(name: &str) -> Option<&'static CatalogEntry> {
    let name = name.trim();
    CATALOG
        .iter()
        .find(|entry| entry.name.eq_ignore_ascii_case(name) || entry.input.eq_ignore_ascii_case(name))
}

/// Position in [`CATALOG`]; defines channel order
pub fn position(entry: &CatalogEntry) -> usize {
    CATALOG
        .iter()
        .position(|candidate| candidate.name == entry.name)
        .unwrap_or(usize::MAX)
}
