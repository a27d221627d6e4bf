//! Pause inference and overall game status

use std::time::{Duration, Instant};

use serde::Serialize;

/// Minimum wall time between two observations before deciding anything
pub const PAUSE_WINDOW: Duration = Duration::from_secs(3);
/// Scenario seconds that must pass within the window to count as running
pub const MIN_ADVANCE_SECS: f64 = 1.0;

/// Infers `paused` from scenario time not advancing
#[derive(Debug, Default)]
pub struct ScenarioClock {
    reference: Option<(f64, Instant)>,
    paused: bool,
}

impl ScenarioClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the latest scenario time. Returns `None` while no scenario time
    /// is available, otherwise the current pause verdict.
    pub fn observe(&mut self, scenario_time: Option<f64>, now: Instant) -> Option<bool> {
        let Some(time) = scenario_time else {
            self.reference = None;
            self.paused = false;
            return None;
        };

        let Some((ref_time, ref_at)) = self.reference else {
            self.reference = Some((time, now));
            return Some(self.paused);
        };

        if now.saturating_duration_since(ref_at) < PAUSE_WINDOW {
            return Some(self.paused);
        }

        if time < ref_time {
            // Scenario restarted
            self.paused = false;
        } else {
            self.paused = time - ref_time < MIN_ADVANCE_SECS;
        }
        self.reference = Some((time, now));
        Some(self.paused)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Setup,
    Playing,
    Paused,
    GameOverVictory,
    GameOverDefeat,
}

impl GameStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::Setup => "setup",
            GameStatus::Playing => "playing",
            GameStatus::Paused => "paused",
            GameStatus::GameOverVictory => "game_over_victory",
            GameStatus::GameOverDefeat => "game_over_defeat",
        }
    }

    /// A declared victor ends the game; the players win when it is a human faction
    pub fn derive(game_active: bool, paused: bool, victory_faction: Option<&str>) -> Self {
        match victory_faction.map(str::trim).filter(|f| !f.is_empty()) {
            Some(faction) if faction.to_ascii_lowercase().contains("human") => GameStatus::GameOverVictory,
            Some(_) => GameStatus::GameOverDefeat,
            None if !game_active => GameStatus::Setup,
            None if paused => GameStatus::Paused,
            None => GameStatus::Playing,
        }
    }
}
