//! Channel map
//!
//! Immutable assignment of broadcast variables to channel indices, with the
//! decode rule for each channel. Built once from configuration and shared
//! (behind an `Arc`) by the decoder and the `hardware-ini` generator.

pub mod catalog;
pub mod hardware_ini;

use std::time::Duration;

use smallvec::SmallVec;
use thiserror::Error;

use crate::fusion::field::FieldValue;
use catalog::CatalogEntry;

/// Highest universe number allowed by E1.31
pub const MAX_UNIVERSE: u16 = 63999;
/// Slots in one DMX universe
pub const MAX_CHANNELS: u16 = 512;

/// Invalid configuration; fatal at startup
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{selected} variables selected but only {available} channels configured")]
    ChannelOverflow { selected: usize, available: u16 },

    #[error("unknown broadcast variable '{0}'")]
    UnknownVariable(String),

    #[error("no broadcast variables selected")]
    EmptySelection,

    #[error("universe {0} outside 1..=63999")]
    InvalidUniverse(u16),

    #[error("channel count {0} outside 1..=512")]
    InvalidChannelCount(u16),

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

/// Compile-time form of a decode rule, used by the catalog
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleKind {
    Linear { min_out: f64, max_out: f64 },
    Boolean { threshold: u8 },
    Enum(&'static [(u8, u8, &'static str)]),
}

/// Raw-range to label row of an enum rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumRange {
    pub low: u8,
    pub high: u8,
    pub label: String,
}

/// How a raw channel byte becomes a field value
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeRule {
    /// Scale `min_in..max_in` onto `min_out..max_out`, clamped to the output range
    Linear {
        min_in: f64,
        max_in: f64,
        min_out: f64,
        max_out: f64,
    },
    /// `raw >= threshold`
    Boolean { threshold: u8 },
    Enum(SmallVec<[EnumRange; 4]>),
}

impl DecodeRule {
    pub fn decode(&self, raw: u8) -> Option<FieldValue> {
        match self {
            DecodeRule::Linear {
                min_in,
                max_in,
                min_out,
                max_out,
            } => {
                let span = max_in - min_in;
                let value = if span == 0.0 {
                    *min_out
                } else {
                    min_out + (f64::from(raw) - min_in) / span * (max_out - min_out)
                };
                let (lo, hi) = if min_out <= max_out {
                    (*min_out, *max_out)
                } else {
                    (*max_out, *min_out)
                };
                Some(FieldValue::Number(value.clamp(lo, hi)))
            }
            DecodeRule::Boolean { threshold } => Some(FieldValue::Flag(raw >= *threshold)),
            DecodeRule::Enum(table) => table
                .iter()
                .find(|range| (range.low..=range.high).contains(&raw))
                .map(|range| FieldValue::Text(range.label.clone())),
        }
    }
}

impl From<RuleKind> for DecodeRule {
    fn from(kind: RuleKind) -> Self {
        match kind {
            RuleKind::Linear { min_out, max_out } => DecodeRule::Linear {
                min_in: 0.0,
                max_in: 255.0,
                min_out,
                max_out,
            },
            RuleKind::Boolean { threshold } => DecodeRule::Boolean { threshold },
            RuleKind::Enum(table) => DecodeRule::Enum(
                table
                    .iter()
                    .map(|&(low, high, label)| EnumRange {
                        low,
                        high,
                        label: label.to_string(),
                    })
                    .collect(),
            ),
        }
    }
}

/// One assigned channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub name: String,
    /// 1-based slot number
    pub channel_index: u16,
    pub rule: DecodeRule,
    pub entry: &'static CatalogEntry,
}

/// Inputs to [`ChannelMap::generate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMapConfig {
    pub universe: u16,
    pub channel_count: u16,
    pub resend_delay: Duration,
    pub variables: Vec<String>,
}

impl Default for ChannelMapConfig {
    fn default() -> Self {
        Self {
            universe: 2,
            channel_count: 50,
            resend_delay: Duration::from_millis(50),
            variables: catalog::DEFAULT_SELECTION.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMap {
    universe: u16,
    channel_count: u16,
    resend_delay: Duration,
    channels: Vec<ChannelDescriptor>,
}

impl ChannelMap {
    /// Assign channels to the selected variables.
    ///
    /// Variables are packed from channel 1 in catalog order, so the result
    /// does not depend on selection order or duplicates.
    pub fn generate(config: &ChannelMapConfig) -> Result<Self, ConfigError> {
        if config.universe == 0 || config.universe > MAX_UNIVERSE {
            return Err(ConfigError::InvalidUniverse(config.universe));
        }
        if config.channel_count == 0 || config.channel_count > MAX_CHANNELS {
            return Err(ConfigError::InvalidChannelCount(config.channel_count));
        }

        let mut selected: Vec<&'static CatalogEntry> = Vec::with_capacity(config.variables.len());
        for name in config.variables.iter().filter(|name| !name.trim().is_empty()) {
            let entry = catalog::lookup(name).ok_or_else(|| ConfigError::UnknownVariable(name.trim().to_string()))?;
            if !selected.iter().any(|chosen| chosen.name == entry.name) {
                selected.push(entry);
            }
        }

        if selected.is_empty() {
            return Err(ConfigError::EmptySelection);
        }
        if selected.len() > usize::from(config.channel_count) {
            return Err(ConfigError::ChannelOverflow {
                selected: selected.len(),
                available: config.channel_count,
            });
        }

        selected.sort_by_key(|entry| catalog::position(entry));

        let channels = selected
            .into_iter()
            .zip(1u16..)
            .map(|(entry, channel_index)| ChannelDescriptor {
                name: entry.name.to_string(),
                channel_index,
                rule: entry.rule.into(),
                entry,
            })
            .collect();

        Ok(Self {
            universe: config.universe,
            channel_count: config.channel_count,
            resend_delay: config.resend_delay,
            channels,
        })
    }

    pub fn universe(&self) -> u16 {
        self.universe
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn resend_delay(&self) -> Duration {
        self.resend_delay
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn descriptor(&self, name: &str) -> Option<&ChannelDescriptor> {
        self.channels.iter().find(|channel| channel.name == name)
    }

    /// Decode every mapped channel present in `slots` (slot 0 is channel 1)
    pub fn decode_slots<'a>(&'a self, slots: &'a [u8]) -> impl Iterator<Item = (&'a str, FieldValue)> + 'a {
        self.channels.iter().filter_map(move |channel| {
            let raw = *slots.get(usize::from(channel.channel_index) - 1)?;
            channel.rule.decode(raw).map(|value| (channel.name.as_str(), value))
        })
    }

    /// Render the broadcaster configuration file
    pub fn to_hardware_ini(&self) -> String {
        hardware_ini::render(self)
    }
}
