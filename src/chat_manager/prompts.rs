//! Prompt presets.
//!
//! A preset is the list of prompt definitions, the order they are assembled
//! in, the format templates wrapping character fields and lorebook text, and
//! the utility prompts used for separators and nudges. Presets are validated
//! when loaded; an invalid preset never reaches the assembler.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use super::types::Role;
use crate::error::ConfigError;

/// Identifiers every preset must define exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemPromptId {
    Main,
    WorldInfoBefore,
    PersonaDescription,
    CharDescription,
    CharPersonality,
    Scenario,
    EnhanceDefinitions,
    Nsfw,
    WorldInfoAfter,
    DialogueExamples,
    ChatHistory,
    Jailbreak,
}

impl SystemPromptId {
    /// Stock assembly order.
    pub const ALL: [SystemPromptId; 12] = [
        SystemPromptId::Main,
        SystemPromptId::WorldInfoBefore,
        SystemPromptId::PersonaDescription,
        SystemPromptId::CharDescription,
        SystemPromptId::CharPersonality,
        SystemPromptId::Scenario,
        SystemPromptId::EnhanceDefinitions,
        SystemPromptId::Nsfw,
        SystemPromptId::WorldInfoAfter,
        SystemPromptId::DialogueExamples,
        SystemPromptId::ChatHistory,
        SystemPromptId::Jailbreak,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemPromptId::Main => "main",
            SystemPromptId::WorldInfoBefore => "worldInfoBefore",
            SystemPromptId::PersonaDescription => "personaDescription",
            SystemPromptId::CharDescription => "charDescription",
            SystemPromptId::CharPersonality => "charPersonality",
            SystemPromptId::Scenario => "scenario",
            SystemPromptId::EnhanceDefinitions => "enhanceDefinitions",
            SystemPromptId::Nsfw => "nsfw",
            SystemPromptId::WorldInfoAfter => "worldInfoAfter",
            SystemPromptId::DialogueExamples => "dialogueExamples",
            SystemPromptId::ChatHistory => "chatHistory",
            SystemPromptId::Jailbreak => "jailbreak",
        }
    }

    /// Markers have their content synthesized during assembly.
    pub fn is_marker(&self) -> bool {
        !matches!(
            self,
            SystemPromptId::Main
                | SystemPromptId::EnhanceDefinitions
                | SystemPromptId::Nsfw
                | SystemPromptId::Jailbreak
        )
    }

    /// Markers that expand to several messages cannot be injected at a depth.
    fn allows_absolute(&self) -> bool {
        !matches!(self, SystemPromptId::ChatHistory | SystemPromptId::DialogueExamples)
    }
}

impl fmt::Display for SystemPromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemPromptId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SystemPromptId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PromptEntryPosition {
    #[default]
    Relative,
    Absolute,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_prompt: bool,
    #[serde(default)]
    pub marker: bool,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub injection_position: PromptEntryPosition,
    /// Messages counted from the end of chat history; only for absolute prompts.
    #[serde(default)]
    pub injection_depth: u32,
    #[serde(default)]
    pub forbid_overrides: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Prompt {
    pub fn system(id: SystemPromptId, name: &str, content: &str) -> Self {
        Self {
            identifier: id.as_str().to_string(),
            name: name.to_string(),
            system_prompt: true,
            marker: false,
            role: Some(Role::System),
            content: Some(content.to_string()),
            injection_position: PromptEntryPosition::Relative,
            injection_depth: 0,
            forbid_overrides: false,
            enabled: true,
        }
    }

    pub fn marker(id: SystemPromptId, name: &str) -> Self {
        Self {
            role: None,
            content: None,
            marker: true,
            ..Self::system(id, name, "")
        }
    }

    pub fn custom(identifier: &str, role: Role, content: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            name: identifier.to_string(),
            system_prompt: false,
            role: Some(role),
            ..Self::system(SystemPromptId::Main, "", content)
        }
    }

    pub fn at_depth(mut self, depth: u32) -> Self {
        self.injection_position = PromptEntryPosition::Absolute;
        self.injection_depth = depth;
        self
    }

    pub fn system_id(&self) -> Option<SystemPromptId> {
        self.identifier.parse().ok()
    }

    pub fn is_absolute(&self) -> bool {
        self.injection_position == PromptEntryPosition::Absolute
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let has_content = self.content.as_deref().map_or(false, |c| !c.is_empty());
        let fixed = self.system_id();

        if let Some(id) = fixed {
            if id.is_marker() != self.marker {
                return Err(ConfigError::Invalid(format!(
                    "prompt '{}' must {}be a marker",
                    self.identifier,
                    if id.is_marker() { "" } else { "not " }
                )));
            }
        }

        if self.marker {
            if self.role.is_some() || has_content {
                return Err(ConfigError::MarkerWithContent(self.identifier.clone()));
            }
        } else if self.role.is_none() || self.content.is_none() {
            return Err(ConfigError::MissingContent(self.identifier.clone()));
        }

        if self.is_absolute() {
            let legal = match fixed {
                Some(id) if self.marker => id.allows_absolute(),
                Some(_) => false,
                None => !self.system_prompt || self.marker,
            };
            if !legal {
                return Err(ConfigError::IllegalAbsoluteDepth(self.identifier.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptOrderEntry {
    pub identifier: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PromptOrderEntry {
    pub fn new(identifier: &str, enabled: bool) -> Self {
        Self {
            identifier: identifier.to_string(),
            enabled,
        }
    }
}

/// A prompt paired with its effective enabled flag from the order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPrompt<'a> {
    pub prompt: &'a Prompt,
    pub enabled: bool,
}

pub const FORMAT_PLACEHOLDER: &str = "{0}";

/// Wraps `value` in a `{0}` format template. Empty values stay empty.
pub fn apply_format(template: &str, value: &str) -> String {
    if value.trim().is_empty() {
        return String::new();
    }
    if template.contains(FORMAT_PLACEHOLDER) {
        template.replace(FORMAT_PLACEHOLDER, value)
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptPreset {
    pub prompts: Vec<Prompt>,
    pub prompt_order: Vec<PromptOrderEntry>,
    pub wi_format: String,
    pub description_format: String,
    pub personality_format: String,
    pub scenario_format: String,
    pub persona_format: String,
    pub new_chat_prompt: String,
    pub new_group_chat_prompt: String,
    pub new_example_chat_prompt: String,
    pub continue_nudge_prompt: String,
    pub impersonation_prompt: String,
    pub group_nudge_prompt: String,
    pub squash_system_messages: bool,
}

impl Default for PromptPreset {
    fn default() -> Self {
        let prompts = SystemPromptId::ALL
            .iter()
            .map(|id| match id {
                SystemPromptId::Main => Prompt::system(
                    *id,
                    "Main Prompt",
                    "Write {{char}}'s next reply in a fictional chat between {{charIfNotGroup}} and {{user}}.",
                ),
                SystemPromptId::EnhanceDefinitions => Prompt::system(
                    *id,
                    "Enhance Definitions",
                    "If you have more knowledge of {{char}}, add to the character's lore and personality to enhance them but keep the Character Sheet's definitions absolute.",
                ),
                SystemPromptId::Nsfw => Prompt::system(*id, "Auxiliary Prompt", ""),
                SystemPromptId::Jailbreak => Prompt::system(*id, "Post-History Instructions", ""),
                SystemPromptId::WorldInfoBefore => Prompt::marker(*id, "World Info (before)"),
                SystemPromptId::WorldInfoAfter => Prompt::marker(*id, "World Info (after)"),
                SystemPromptId::PersonaDescription => Prompt::marker(*id, "Persona Description"),
                SystemPromptId::CharDescription => Prompt::marker(*id, "Char Description"),
                SystemPromptId::CharPersonality => Prompt::marker(*id, "Char Personality"),
                SystemPromptId::Scenario => Prompt::marker(*id, "Scenario"),
                SystemPromptId::DialogueExamples => Prompt::marker(*id, "Chat Examples"),
                SystemPromptId::ChatHistory => Prompt::marker(*id, "Chat History"),
            })
            .collect();

        let prompt_order = SystemPromptId::ALL
            .iter()
            .map(|id| PromptOrderEntry::new(id.as_str(), *id != SystemPromptId::EnhanceDefinitions))
            .collect();

        Self {
            prompts,
            prompt_order,
            wi_format: FORMAT_PLACEHOLDER.to_string(),
            description_format: FORMAT_PLACEHOLDER.to_string(),
            personality_format: format!("{{{{char}}}}'s personality: {}", FORMAT_PLACEHOLDER),
            scenario_format: format!("Scenario: {}", FORMAT_PLACEHOLDER),
            persona_format: FORMAT_PLACEHOLDER.to_string(),
            new_chat_prompt: "[Start a new Chat]".to_string(),
            new_group_chat_prompt: "[Start a new group chat. Group members: {{group}}]".to_string(),
            new_example_chat_prompt: "[Example Chat]".to_string(),
            continue_nudge_prompt: "[Continue the following message. Do not include ANY parts of the original message. Use capitalization and punctuation as if your reply is a part of the original message: {{lastChatMessage}}]".to_string(),
            impersonation_prompt: "[Write your next reply from the point of view of {{user}}, using the chat history so far as a guideline for the writing style of {{user}}. Don't write as {{char}} or system. Don't describe actions of {{char}}.]".to_string(),
            group_nudge_prompt: "[Write the next reply only as {{char}}.]".to_string(),
            squash_system_messages: false,
        }
    }
}

impl PromptPreset {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let preset: PromptPreset = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid(format!("preset JSON: {}", e)))?;
        preset.validate()?;
        Ok(preset)
    }

    pub fn prompt(&self, identifier: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.identifier == identifier)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for prompt in &self.prompts {
            if !seen.insert(prompt.identifier.as_str()) {
                return Err(ConfigError::DuplicatePrompt(prompt.identifier.clone()));
            }
            prompt.validate()?;
        }
        for id in SystemPromptId::ALL {
            if !seen.contains(id.as_str()) {
                return Err(ConfigError::MissingSystemPrompt(id.as_str().to_string()));
            }
        }
        self.resolve_order().map(|_| ())
    }

    /// The prompt order joined with the prompt definitions. Every fixed
    /// identifier appears exactly once: ones the order forgot are appended
    /// disabled. A prompt is enabled only when both its definition and its
    /// order entry are.
    pub fn resolve_order(&self) -> Result<Vec<ResolvedPrompt<'_>>, ConfigError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut resolved = Vec::with_capacity(self.prompt_order.len());

        for entry in &self.prompt_order {
            if !seen.insert(entry.identifier.as_str()) {
                return Err(ConfigError::DuplicateOrderEntry(entry.identifier.clone()));
            }
            let prompt = self
                .prompt(&entry.identifier)
                .ok_or_else(|| ConfigError::UnknownOrderEntry(entry.identifier.clone()))?;
            resolved.push(ResolvedPrompt {
                prompt,
                enabled: entry.enabled && prompt.enabled,
            });
        }

        for id in SystemPromptId::ALL {
            if seen.contains(id.as_str()) {
                continue;
            }
            let prompt = self
                .prompt(id.as_str())
                .ok_or_else(|| ConfigError::MissingSystemPrompt(id.as_str().to_string()))?;
            tracing::warn!(target: "prompt_engine", identifier = id.as_str(), "prompt order is missing a system prompt, appending it disabled");
            resolved.push(ResolvedPrompt {
                prompt,
                enabled: false,
            });
        }
        Ok(resolved)
    }
}

// ============================================================================
// Extension prompts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExtensionPosition {
    BeforeMain,
    #[default]
    #[serde(alias = "inPrompt")]
    AfterMain,
    InChat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionPrompt {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub position: ExtensionPosition,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub role: Role,
}

/// Extension prompts keyed by unique name, kept in registration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionPrompts {
    prompts: Vec<ExtensionPrompt>,
}

impl ExtensionPrompts {
    pub fn new(prompts: Vec<ExtensionPrompt>) -> Result<Self, ConfigError> {
        let mut out = Self::default();
        for prompt in prompts {
            out.insert(prompt)?;
        }
        Ok(out)
    }

    pub fn insert(&mut self, prompt: ExtensionPrompt) -> Result<(), ConfigError> {
        if self.prompts.iter().any(|p| p.name == prompt.name) {
            return Err(ConfigError::DuplicateExtensionPrompt(prompt.name));
        }
        self.prompts.push(prompt);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionPrompt> {
        self.prompts.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtensionPrompt> {
        self.prompts.iter()
    }

    pub fn at(&self, position: ExtensionPosition) -> impl Iterator<Item = &ExtensionPrompt> {
        self.prompts.iter().filter(move |p| p.position == position)
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preset_is_valid_and_complete() {
        let preset = PromptPreset::default();
        preset.validate().unwrap();
        let order = preset.resolve_order().unwrap();
        for id in SystemPromptId::ALL {
            let count = order.iter().filter(|r| r.prompt.identifier == id.as_str()).count();
            assert_eq!(count, 1, "{} should appear once", id);
        }
        let enhance = order
            .iter()
            .find(|r| r.prompt.identifier == "enhanceDefinitions")
            .unwrap();
        assert!(!enhance.enabled);
    }

    #[test]
    fn missing_order_entries_are_appended_disabled() {
        let mut preset = PromptPreset::default();
        preset.prompt_order.retain(|e| e.identifier != "jailbreak");
        let order = preset.resolve_order().unwrap();
        let last = order.last().unwrap();
        assert_eq!(last.prompt.identifier, "jailbreak");
        assert!(!last.enabled);
        assert_eq!(order.len(), SystemPromptId::ALL.len());
    }

    #[test]
    fn missing_system_prompt_is_fatal() {
        let mut preset = PromptPreset::default();
        preset.prompts.retain(|p| p.identifier != "scenario");
        preset.prompt_order.retain(|e| e.identifier != "scenario");
        assert_eq!(
            preset.validate(),
            Err(ConfigError::MissingSystemPrompt("scenario".into()))
        );
    }

    #[test]
    fn marker_with_content_is_rejected() {
        let mut preset = PromptPreset::default();
        if let Some(p) = preset.prompts.iter_mut().find(|p| p.identifier == "chatHistory") {
            p.content = Some("oops".into());
        }
        assert_eq!(
            preset.validate(),
            Err(ConfigError::MarkerWithContent("chatHistory".into()))
        );
    }

    #[test]
    fn absolute_depth_rules() {
        let mut preset = PromptPreset::default();
        preset.prompts.push(Prompt::custom("note", Role::User, "Remember the key.").at_depth(2));
        preset.prompt_order.push(PromptOrderEntry::new("note", true));
        preset.validate().unwrap();

        if let Some(p) = preset.prompts.iter_mut().find(|p| p.identifier == "main") {
            p.injection_position = PromptEntryPosition::Absolute;
        }
        assert_eq!(preset.validate(), Err(ConfigError::IllegalAbsoluteDepth("main".into())));
    }

    #[test]
    fn order_errors() {
        let mut preset = PromptPreset::default();
        preset.prompt_order.push(PromptOrderEntry::new("ghost", true));
        assert_eq!(preset.validate(), Err(ConfigError::UnknownOrderEntry("ghost".into())));

        let mut preset = PromptPreset::default();
        preset.prompt_order.push(PromptOrderEntry::new("main", true));
        assert_eq!(preset.validate(), Err(ConfigError::DuplicateOrderEntry("main".into())));
    }

    #[test]
    fn preset_json_round_trips_through_validation() {
        let json = serde_json::to_string(&PromptPreset::default()).unwrap();
        let preset = PromptPreset::from_json_str(&json).unwrap();
        assert_eq!(preset, PromptPreset::default());
        assert!(matches!(PromptPreset::from_json_str("{"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_extension_prompt_names_are_fatal() {
        let prompt = ExtensionPrompt {
            name: "summary".into(),
            content: "x".into(),
            position: ExtensionPosition::AfterMain,
            depth: 0,
            role: Role::System,
        };
        let err = ExtensionPrompts::new(vec![prompt.clone(), prompt]).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateExtensionPrompt("summary".into()));
    }

    #[test]
    fn format_templates_wrap_non_empty_values() {
        assert_eq!(apply_format("Scenario: {0}", "a cave"), "Scenario: a cave");
        assert_eq!(apply_format("Scenario: {0}", "  "), "");
        assert_eq!(apply_format("no slot", "x"), "x");
    }
}
