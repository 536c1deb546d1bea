use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Balanced,
    Thorough,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Balanced => "balanced",
            Tier::Thorough => "thorough",
        }
    }
}

/// One (provider, model, tier) triple acting as an independent reviewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Voice {
    pub provider: String,
    pub model: String,
    pub tier: Tier,
}

impl Voice {
    /// Stable id used in progress events and ordering tie-breaks.
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LevelConfig {
    pub enabled: bool,
    #[serde(default)]
    pub voices: Vec<Voice>,
}

/// Normalized council configuration: per-level voice assignments plus a
/// consolidation voice. Both wire shapes reduce to this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CouncilConfig {
    pub levels: BTreeMap<u8, LevelConfig>,
    pub consolidation: Voice,
}

/// Voice-centric wire shape: one voice list shared by every enabled level.
#[derive(Debug, Clone, Deserialize)]
struct VoiceCentricWire {
    voices: Vec<Voice>,
    levels: BTreeMap<String, bool>,
    consolidation: Voice,
}

/// Level-centric ("advanced") wire shape: per-level voice lists.
#[derive(Debug, Clone, Deserialize)]
struct LevelCentricWire {
    levels: BTreeMap<String, LevelConfig>,
    #[serde(default)]
    consolidation: Option<Voice>,
}

fn parse_level_key(key: &str) -> Result<u8> {
    match key.parse::<u8>() {
        Ok(n @ 1..=3) => Ok(n),
        _ => Err(Error::InvalidInput(format!(
            "council level must be 1, 2 or 3, got: {key}"
        ))),
    }
}

impl CouncilConfig {
    /// Accept either wire shape and produce the normalized form.
    ///
    /// `config_type` (`council` | `advanced`) picks the shape explicitly;
    /// without it the shape is sniffed from the `levels` values (bools mean
    /// voice-centric, objects mean level-centric). Feeding a normalized
    /// config back in is a no-op, so normalization is idempotent.
    pub fn from_value(value: &serde_json::Value, config_type: Option<&str>) -> Result<Self> {
        let advanced = match config_type {
            Some("council") => false,
            Some("advanced") => true,
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "unknown config_type: {other} (expected: council, advanced)"
                )));
            }
            None => value
                .get("levels")
                .and_then(|l| l.as_object())
                .is_some_and(|m| m.values().any(|v| v.is_object())),
        };

        if advanced {
            let wire: LevelCentricWire = serde_json::from_value(value.clone())
                .map_err(|e| Error::InvalidInput(format!("bad council config: {e}")))?;
            let mut levels = BTreeMap::new();
            for (key, level) in wire.levels {
                levels.insert(parse_level_key(&key)?, level);
            }
            let consolidation = match wire.consolidation {
                Some(v) => v,
                None => levels
                    .values()
                    .filter(|l| l.enabled)
                    .flat_map(|l| l.voices.first())
                    .next()
                    .cloned()
                    .ok_or_else(|| {
                        Error::InvalidInput("council has no voice to consolidate with".into())
                    })?,
            };
            let config = CouncilConfig {
                levels,
                consolidation,
            };
            config.validate()?;
            Ok(config)
        } else {
            let wire: VoiceCentricWire = serde_json::from_value(value.clone())
                .map_err(|e| Error::InvalidInput(format!("bad council config: {e}")))?;
            let mut levels = BTreeMap::new();
            for (key, enabled) in wire.levels {
                let level = parse_level_key(&key)?;
                levels.insert(
                    level,
                    LevelConfig {
                        enabled,
                        voices: if enabled { wire.voices.clone() } else { vec![] },
                    },
                );
            }
            let config = CouncilConfig {
                levels,
                consolidation: wire.consolidation,
            };
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let enabled: Vec<&LevelConfig> = self.levels.values().filter(|l| l.enabled).collect();
        if enabled.is_empty() {
            return Err(Error::InvalidInput(
                "council config enables no analysis level".into(),
            ));
        }
        if let Some(level) = self
            .levels
            .iter()
            .find(|(_, l)| l.enabled && l.voices.is_empty())
        {
            return Err(Error::InvalidInput(format!(
                "council level {} is enabled but has no voices",
                level.0
            )));
        }
        Ok(())
    }

    /// Levels that are enabled, ascending.
    pub fn enabled_levels(&self) -> Vec<u8> {
        self.levels
            .iter()
            .filter(|(_, l)| l.enabled)
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn voices_for_level(&self, level: u8) -> &[Voice] {
        self.levels
            .get(&level)
            .map(|l| l.voices.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn voice(provider: &str, model: &str) -> serde_json::Value {
        json!({"provider": provider, "model": model, "tier": "balanced"})
    }

    #[test]
    fn test_voice_centric_replicates_voices_to_enabled_levels() {
        let value = json!({
            "voices": [voice("anthropic", "claude"), voice("google", "gemini")],
            "levels": {"1": true, "2": true, "3": false},
            "consolidation": voice("anthropic", "claude"),
        });
        let config = CouncilConfig::from_value(&value, None).unwrap();
        assert_eq!(config.enabled_levels(), vec![1, 2]);
        assert_eq!(config.voices_for_level(1).len(), 2);
        assert_eq!(config.voices_for_level(2).len(), 2);
        assert!(config.voices_for_level(3).is_empty());
    }

    #[test]
    fn test_level_centric_keeps_per_level_voices() {
        let value = json!({
            "levels": {
                "1": {"enabled": true, "voices": [voice("anthropic", "claude")]},
                "2": {"enabled": true, "voices": [voice("google", "gemini"), voice("openai", "gpt")]},
            },
        });
        let config = CouncilConfig::from_value(&value, None).unwrap();
        assert_eq!(config.voices_for_level(1).len(), 1);
        assert_eq!(config.voices_for_level(2).len(), 2);
        // Consolidation defaults to the first voice of the lowest enabled level
        assert_eq!(config.consolidation.model, "claude");
    }

    #[test]
    fn test_explicit_config_type_wins_over_sniffing() {
        let value = json!({
            "levels": {"1": {"enabled": true, "voices": [voice("a", "m")]}},
        });
        // Forcing "council" against an advanced-shaped body must fail to parse
        assert!(CouncilConfig::from_value(&value, Some("council")).is_err());
        assert!(CouncilConfig::from_value(&value, Some("advanced")).is_ok());
    }

    #[test]
    fn test_unknown_config_type_rejected() {
        let err = CouncilConfig::from_value(&json!({}), Some("committee")).unwrap_err();
        assert!(err.to_string().contains("unknown config_type"));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let value = json!({
            "voices": [voice("anthropic", "claude")],
            "levels": {"1": true},
            "consolidation": voice("anthropic", "claude"),
        });
        let once = CouncilConfig::from_value(&value, None).unwrap();
        let reserialized = serde_json::to_value(&once).unwrap();
        let twice = CouncilConfig::from_value(&reserialized, None).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_no_enabled_level_rejected() {
        let value = json!({
            "voices": [voice("a", "m")],
            "levels": {"1": false, "2": false},
            "consolidation": voice("a", "m"),
        });
        let err = CouncilConfig::from_value(&value, None).unwrap_err();
        assert!(err.to_string().contains("no analysis level"));
    }

    #[test]
    fn test_enabled_level_without_voices_rejected() {
        let value = json!({
            "levels": {"1": {"enabled": true, "voices": []}},
            "consolidation": voice("a", "m"),
        });
        let err = CouncilConfig::from_value(&value, None).unwrap_err();
        assert!(err.to_string().contains("has no voices"));
    }

    #[test]
    fn test_level_key_out_of_range_rejected() {
        let value = json!({
            "voices": [voice("a", "m")],
            "levels": {"4": true},
            "consolidation": voice("a", "m"),
        });
        let err = CouncilConfig::from_value(&value, None).unwrap_err();
        assert!(err.to_string().contains("must be 1, 2 or 3"));
    }

    #[test]
    fn test_voice_id() {
        let v = Voice {
            provider: "anthropic".into(),
            model: "claude".into(),
            tier: Tier::Thorough,
        };
        assert_eq!(v.id(), "anthropic/claude");
    }
}
