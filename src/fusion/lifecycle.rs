//! Ship identity tracking against the authoritative ship list
//!
//! Each poll cycle that successfully enumerates ships yields a [`ShipRoster`].
//! [`LifecycleManager`] admits new identities from it and retires ships that
//! have been missing for `absence_limit` consecutive rosters. Cycles without a
//! roster (enumeration failed) never count as an absence.

use std::time::Instant;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, warn};

use super::field::ShipKey;
use super::snapshot::ShipIdentity;

/// Default consecutive absences before a ship is retired
pub const DEFAULT_ABSENCE_LIMIT: u32 = 2;

/// One row of the server's ship enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipListing {
    pub index: u32,
    pub callsign: String,
}

impl ShipListing {
    pub fn new(index: u32, callsign: impl Into<String>) -> Self {
        Self {
            index,
            callsign: callsign.into(),
        }
    }
}

/// Listing resolved to a durable key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub key: ShipKey,
    pub index: u32,
    pub callsign: String,
    /// Callsign exactly as the server reported it, whitespace included
    pub reported_callsign: String,
    /// Callsign already claimed by a lower index
    pub duplicate: bool,
}

/// Two ships reported the same callsign
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAmbiguity {
    pub callsign: String,
    pub kept_index: u32,
    pub duplicate_index: u32,
    pub duplicate_key: ShipKey,
}

/// Authoritative set of ships for one poll cycle, ordered by index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipRoster {
    entries: Vec<RosterEntry>,
    ambiguities: Vec<IdentityAmbiguity>,
}

impl ShipRoster {
    /// Resolve keys from raw listings.
    ///
    /// The key is the trimmed callsign. A callsign seen again at a higher index
    /// gets `callsign#index` so the two ships stay separate, and the pair is
    /// recorded as an ambiguity. Ships without a callsign are keyed `ship-index`.
    pub fn from_listing(mut listing: Vec<ShipListing>) -> Self {
        listing.sort_by_key(|row| row.index);
        listing.dedup_by_key(|row| row.index);

        let mut claimed: HashMap<String, u32> = HashMap::with_capacity(listing.len());
        let mut entries = Vec::with_capacity(listing.len());
        let mut ambiguities = Vec::new();

        for row in listing {
            let callsign = row.callsign.trim().to_string();
            let base = if callsign.is_empty() {
                format!("ship-{}", row.index)
            } else {
                callsign.clone()
            };

            match claimed.get(&base) {
                Some(&kept_index) => {
                    let key = ShipKey::new(format!("{}#{}", base, row.index));
                    ambiguities.push(IdentityAmbiguity {
                        callsign: callsign.clone(),
                        kept_index,
                        duplicate_index: row.index,
                        duplicate_key: key.clone(),
                    });
                    entries.push(RosterEntry {
                        key,
                        index: row.index,
                        callsign,
                        reported_callsign: row.callsign,
                        duplicate: true,
                    });
                }
                None => {
                    claimed.insert(base.clone(), row.index);
                    entries.push(RosterEntry {
                        key: ShipKey::new(base),
                        index: row.index,
                        callsign,
                        reported_callsign: row.callsign,
                        duplicate: false,
                    });
                }
            }
        }

        Self {
            entries,
            ambiguities,
        }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn ambiguities(&self) -> &[IdentityAmbiguity] {
        &self.ambiguities
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ShipKey) -> bool {
        self.entries.iter().any(|entry| &entry.key == key)
    }

    pub fn get(&self, key: &ShipKey) -> Option<&RosterEntry> {
        self.entries.iter().find(|entry| &entry.key == key)
    }

    /// Ship that receives broadcast fields: lowest index without a duplicate callsign
    pub fn primary(&self) -> Option<&RosterEntry> {
        self.entries.iter().find(|entry| !entry.duplicate)
    }
}

#[derive(Debug, Clone)]
struct TrackedShip {
    identity: ShipIdentity,
    missed_cycles: u32,
}

/// Result of admitting a roster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// Keys seen for the first time (or again after retirement)
    pub created: Vec<ShipKey>,
    /// (key, old index, new index)
    pub reindexed: Vec<(ShipKey, u32, u32)>,
}

/// Owns ship identity records and absence counting
#[derive(Debug)]
pub struct LifecycleManager {
    tracked: HashMap<ShipKey, TrackedShip>,
    absence_limit: u32,
}

impl LifecycleManager {
    pub fn new(absence_limit: u32) -> Self {
        Self {
            tracked: HashMap::new(),
            absence_limit: absence_limit.max(1),
        }
    }

    /// Track new identities and refresh the ones present in `roster`
    pub fn admit(&mut self, roster: &ShipRoster, now: Instant) -> Admission {
        let mut admission = Admission::default();

        for ambiguity in roster.ambiguities() {
            warn!(
                "Callsign '{}' reported by ships {} and {}; tracking the latter as '{}'",
                ambiguity.callsign, ambiguity.kept_index, ambiguity.duplicate_index, ambiguity.duplicate_key
            );
        }

        for entry in roster.entries() {
            match self.tracked.get_mut(&entry.key) {
                Some(ship) => {
                    ship.missed_cycles = 0;
                    ship.identity.last_seen_at = now;
                    if ship.identity.index != entry.index {
                        debug!(
                            "Ship '{}' moved from index {} to {}",
                            entry.key, ship.identity.index, entry.index
                        );
                        admission
                            .reindexed
                            .push((entry.key.clone(), ship.identity.index, entry.index));
                        ship.identity.index = entry.index;
                    }
                }
                None => {
                    self.tracked.insert(
                        entry.key.clone(),
                        TrackedShip {
                            identity: ShipIdentity {
                                index: entry.index,
                                callsign: entry.callsign.clone(),
                                first_seen_at: now,
                                last_seen_at: now,
                            },
                            missed_cycles: 0,
                        },
                    );
                    admission.created.push(entry.key.clone());
                }
            }
        }

        admission
    }

    /// Count an absence for every tracked ship missing from `roster` and
    /// return the ones that reached the limit. Returned keys are no longer tracked.
    pub fn retire_absent(&mut self, roster: &ShipRoster) -> Vec<ShipKey> {
        let present: HashSet<&ShipKey> = roster.entries().iter().map(|entry| &entry.key).collect();
        let mut retired = Vec::new();

        for (key, ship) in self.tracked.iter_mut() {
            if present.contains(key) {
                continue;
            }
            ship.missed_cycles += 1;
            if ship.missed_cycles >= self.absence_limit {
                retired.push(key.clone());
            } else {
                debug!(
                    "Ship '{}' missing from ship list ({}/{})",
                    key, ship.missed_cycles, self.absence_limit
                );
            }
        }

        for key in &retired {
            self.tracked.remove(key);
        }
        retired.sort();
        retired
    }

    pub fn identity(&self, key: &ShipKey) -> Option<&ShipIdentity> {
        self.tracked.get(key).map(|ship| &ship.identity)
    }

    pub fn is_tracked(&self, key: &ShipKey) -> bool {
        self.tracked.contains_key(key)
    }

    pub fn missed_cycles(&self, key: &ShipKey) -> Option<u32> {
        self.tracked.get(key).map(|ship| ship.missed_cycles)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(DEFAULT_ABSENCE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(rows: &[(u32, &str)]) -> ShipRoster {
        ShipRoster::from_listing(rows.iter().map(|(i, c)| ShipListing::new(*i, *c)).collect())
    }

    #[test]
    fn test_roster_orders_by_index() {
        let roster = roster(&[(3, "Beta"), (1, "Alpha")]);
        let keys: Vec<&str> = roster.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["Alpha", "Beta"]);
        assert_eq!(roster.primary().unwrap().key.as_str(), "Alpha");
    }

    #[test]
    fn test_duplicate_callsign_is_disambiguated() {
        let roster = roster(&[(0, "Alpha"), (2, " Alpha ")]);

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.entries()[0].key.as_str(), "Alpha");
        assert_eq!(roster.entries()[1].key.as_str(), "Alpha#2");
        assert!(roster.entries()[1].duplicate);

        let ambiguity = &roster.ambiguities()[0];
        assert_eq!(ambiguity.kept_index, 0);
        assert_eq!(ambiguity.duplicate_index, 2);
    }

    #[test]
    fn test_primary_skips_duplicates() {
        let roster = roster(&[(0, "Alpha"), (1, "Alpha")]);
        assert_eq!(roster.primary().unwrap().index, 0);
    }

    #[test]
    fn test_padded_callsign_keeps_reported_form() {
        let roster = ShipRoster::from_listing(vec![ShipListing::new(0, " Alpha ")]);
        let entry = &roster.entries()[0];
        assert_eq!(entry.key, ShipKey::new("Alpha"));
        assert_eq!(entry.callsign, "Alpha");
        assert_eq!(entry.reported_callsign, " Alpha ");
    }

    #[test]
    fn test_empty_callsign_keyed_by_index() {
        let roster = roster(&[(4, "")]);
        assert_eq!(roster.entries()[0].key.as_str(), "ship-4");
    }

    #[test]
    fn test_admit_creates_once() {
        let mut lifecycle = LifecycleManager::default();
        let now = Instant::now();

        let first = lifecycle.admit(&roster(&[(0, "Alpha")]), now);
        assert_eq!(first.created, vec![ShipKey::from("Alpha")]);

        let second = lifecycle.admit(&roster(&[(0, "Alpha")]), now);
        assert!(second.created.is_empty());
        assert_eq!(lifecycle.len(), 1);
    }

    #[test]
    fn test_reindex_keeps_identity() {
        let mut lifecycle = LifecycleManager::default();
        let now = Instant::now();
        lifecycle.admit(&roster(&[(0, "Alpha")]), now);

        let admission = lifecycle.admit(&roster(&[(5, "Alpha")]), now);
        assert!(admission.created.is_empty());
        assert_eq!(admission.reindexed, vec![(ShipKey::from("Alpha"), 0, 5)]);
        assert_eq!(lifecycle.identity(&ShipKey::from("Alpha")).unwrap().index, 5);
    }

    #[test]
    fn test_retire_after_two_absences() {
        let mut lifecycle = LifecycleManager::default();
        let now = Instant::now();
        let both = roster(&[(0, "Alpha"), (1, "Beta")]);
        let alpha_only = roster(&[(0, "Alpha")]);

        lifecycle.admit(&both, now);

        lifecycle.admit(&alpha_only, now);
        assert!(lifecycle.retire_absent(&alpha_only).is_empty());
        assert_eq!(lifecycle.missed_cycles(&ShipKey::from("Beta")), Some(1));

        lifecycle.admit(&alpha_only, now);
        assert_eq!(lifecycle.retire_absent(&alpha_only), vec![ShipKey::from("Beta")]);
        assert!(!lifecycle.is_tracked(&ShipKey::from("Beta")));
    }

    #[test]
    fn test_reappearance_resets_absence() {
        let mut lifecycle = LifecycleManager::default();
        let now = Instant::now();
        let both = roster(&[(0, "Alpha"), (1, "Beta")]);
        let alpha_only = roster(&[(0, "Alpha")]);

        lifecycle.admit(&both, now);
        lifecycle.retire_absent(&alpha_only);
        lifecycle.admit(&both, now);
        assert!(lifecycle.retire_absent(&both).is_empty());
        assert_eq!(lifecycle.missed_cycles(&ShipKey::from("Beta")), Some(0));
    }
}
