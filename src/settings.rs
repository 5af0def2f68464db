//! Engine configuration.
//!
//! Everything is plain camelCase JSON with defaults for every field, so a
//! partial settings file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::chat_manager::prompts::ExtensionPosition;
use crate::chat_manager::types::Role;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum InsertionStrategy {
    /// Interleave every source by priority.
    #[serde(alias = "sorted_evenly", alias = "evenly")]
    Evenly,
    #[default]
    #[serde(alias = "character_first")]
    CharacterFirst,
    #[serde(alias = "global_first")]
    GlobalFirst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldInfoSettings {
    /// Number of most recent messages scanned for keys.
    pub scan_depth: usize,
    /// Percentage of the model context usable by lorebook entries.
    pub context: u32,
    /// Absolute token cap; 0 is unlimited.
    pub budget_cap: u32,
    pub min_activations: usize,
    /// Furthest the scan window may grow for min activations; 0 is the whole history.
    pub max_depth: usize,
    /// 0 leaves recursion bounded only by the number of entries.
    pub max_recursion_steps: u32,
    pub insertion_strategy: InsertionStrategy,
    pub include_names: bool,
    pub recursive_scan: bool,
    pub case_sensitive: bool,
    pub match_whole_words: bool,
    pub use_group_scoring: bool,
    pub alert_on_overflow: bool,
}

impl Default for WorldInfoSettings {
    fn default() -> Self {
        Self {
            scan_depth: 2,
            context: 25,
            budget_cap: 0,
            min_activations: 0,
            max_depth: 0,
            max_recursion_steps: 0,
            insertion_strategy: InsertionStrategy::CharacterFirst,
            include_names: true,
            recursive_scan: true,
            case_sensitive: false,
            match_whole_words: false,
            use_group_scoring: false,
            alert_on_overflow: false,
        }
    }
}

impl WorldInfoSettings {
    /// Token budget for lorebook entries: the smaller of `context`% of the
    /// window and `budgetCap`. `None` means unlimited.
    pub fn effective_budget(&self, max_context: u32) -> Option<u32> {
        let from_context = if self.context == 0 || max_context == 0 {
            None
        } else {
            Some((u64::from(max_context) * u64::from(self.context.min(100)) / 100) as u32)
        };
        let from_cap = (self.budget_cap > 0).then_some(self.budget_cap);
        match (from_context, from_cap) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummarySettings {
    pub enabled: bool,
    pub position: ExtensionPosition,
    pub depth: u32,
    pub role: Role,
    /// `{0}` is replaced by the summary text.
    pub template: String,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            position: ExtensionPosition::AfterMain,
            depth: 2,
            role: Role::System,
            template: "[Summary: {0}]".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub world_info: WorldInfoSettings,
    pub summary: SummarySettings,
    pub token_cache_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            world_info: WorldInfoSettings::default(),
            summary: SummarySettings::default(),
            token_cache_capacity: 4096,
        }
    }
}

impl EngineSettings {
    pub fn from_json_str(json: &str) -> std::result::Result<Self, ConfigError> {
        let settings: EngineSettings = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid(format!("settings JSON: {}", e)))?;
        if settings.token_cache_capacity == 0 {
            return Err(ConfigError::Invalid("tokenCacheCapacity must be positive".into()));
        }
        Ok(settings)
    }
}

pub fn load_settings(path: impl AsRef<Path>) -> Result<EngineSettings> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let settings = EngineSettings::from_json_str(&raw)?;
    tracing::debug!(target: "prompt_engine", path = %path.display(), "loaded engine settings");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = EngineSettings::from_json_str(
            r#"{"worldInfo": {"scanDepth": 5, "insertionStrategy": "global_first"}}"#,
        )
        .unwrap();
        assert_eq!(settings.world_info.scan_depth, 5);
        assert_eq!(settings.world_info.insertion_strategy, InsertionStrategy::GlobalFirst);
        assert_eq!(settings.world_info.context, 25);
        assert!(settings.world_info.recursive_scan);
        assert_eq!(settings.token_cache_capacity, 4096);
    }

    #[test]
    fn effective_budget_takes_smaller_limit() {
        let mut wi = WorldInfoSettings::default();
        assert_eq!(wi.effective_budget(8000), Some(2000));
        wi.budget_cap = 500;
        assert_eq!(wi.effective_budget(8000), Some(500));
        wi.context = 0;
        assert_eq!(wi.effective_budget(8000), Some(500));
        wi.budget_cap = 0;
        assert_eq!(wi.effective_budget(8000), None);
    }

    #[test]
    fn zero_cache_capacity_is_rejected() {
        assert!(EngineSettings::from_json_str(r#"{"tokenCacheCapacity": 0}"#).is_err());
    }

    #[test]
    fn load_settings_reads_file() {
        let path = std::env::temp_dir().join(format!("lettuce-settings-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"summary": {"enabled": true}}"#).unwrap();
        let settings = load_settings(&path).unwrap();
        assert!(settings.summary.enabled);
        let _ = std::fs::remove_file(&path);
        assert!(load_settings(&path).is_err());
    }
}
