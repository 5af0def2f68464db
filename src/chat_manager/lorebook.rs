use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use super::types::Role;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SelectiveLogic {
    #[default]
    AndAny,
    AndAll,
    NotAny,
    NotAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum EntryPosition {
    #[default]
    BeforeMain,
    AfterMain,
    AtDepth,
}

/// Where a lorebook was linked from. Declaration order is merge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LorebookSource {
    Chat,
    Persona,
    Character,
    Global,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

fn default_depth() -> u32 {
    4
}

fn default_group_weight() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LorebookEntry {
    pub id: String,
    #[serde(default, alias = "comment")]
    pub title: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Constant entry: activates without any key match.
    #[serde(default, alias = "constant")]
    pub always_active: bool,
    #[serde(default, alias = "keys")]
    pub keywords: Vec<String>,
    #[serde(default, alias = "secondaryKeys")]
    pub secondary_keywords: Vec<String>,
    #[serde(default)]
    pub selective_logic: SelectiveLogic,
    /// Per-entry overrides of the global matching flags.
    #[serde(default)]
    pub case_sensitive: Option<bool>,
    #[serde(default)]
    pub match_whole_words: Option<bool>,
    #[serde(default)]
    pub content: String,
    /// Higher priority is inserted first and survives budget trimming longest.
    #[serde(default = "default_priority", alias = "order")]
    pub priority: i32,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default)]
    pub position: EntryPosition,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default)]
    pub role: Role,
    /// Cannot be activated by text that came from other entries.
    #[serde(default)]
    pub exclude_recursion: bool,
    /// Content is not fed back into the recursion buffer.
    #[serde(default)]
    pub prevent_recursion: bool,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub group_override: bool,
    #[serde(default = "default_group_weight")]
    pub group_weight: u32,
    #[serde(default)]
    pub use_group_scoring: Option<bool>,
}

impl LorebookEntry {
    pub fn new(id: impl Into<String>, keywords: &[&str], content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            enabled: true,
            always_active: false,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            secondary_keywords: Vec::new(),
            selective_logic: SelectiveLogic::AndAny,
            case_sensitive: None,
            match_whole_words: None,
            content: content.into(),
            priority: default_priority(),
            display_order: 0,
            position: EntryPosition::BeforeMain,
            depth: default_depth(),
            role: Role::System,
            exclude_recursion: false,
            prevent_recursion: false,
            group: String::new(),
            group_override: false,
            group_weight: default_group_weight(),
            use_group_scoring: None,
        }
    }

    pub fn constant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            always_active: true,
            ..Self::new(id, &[], content)
        }
    }

    pub fn display_name(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lorebook {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub entries: Vec<LorebookEntry>,
}

/// An entry tagged with the lorebook and link it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEntry {
    pub source: LorebookSource,
    pub lorebook_id: String,
    pub lorebook_name: String,
    pub entry: LorebookEntry,
}

impl MergedEntry {
    pub fn label(&self) -> String {
        format!("{} / {}", self.lorebook_name, self.entry.display_name())
    }
}

/// Lorebooks linked to the current generation, by link kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkedLorebooks {
    pub chat: Vec<Lorebook>,
    pub persona: Vec<Lorebook>,
    pub character: Vec<Lorebook>,
    pub global: Vec<Lorebook>,
}

impl LinkedLorebooks {
    pub fn is_empty(&self) -> bool {
        self.chat.is_empty() && self.persona.is_empty() && self.character.is_empty() && self.global.is_empty()
    }

    /// Flattens all links into one entry list: chat, persona, character, then
    /// global. A lorebook linked more than once is only taken from its first
    /// link; disabled entries are dropped here.
    pub fn merge(&self) -> Vec<MergedEntry> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut merged = Vec::new();
        let links = [
            (LorebookSource::Chat, &self.chat),
            (LorebookSource::Persona, &self.persona),
            (LorebookSource::Character, &self.character),
            (LorebookSource::Global, &self.global),
        ];

        for (source, books) in links {
            for book in books.iter() {
                if !seen.insert(book.id.as_str()) {
                    tracing::debug!(target: "lorebook", lorebook = %book.name, ?source, "lorebook linked twice, keeping first link");
                    continue;
                }
                merged.extend(book.entries.iter().filter(|e| e.enabled).map(|entry| MergedEntry {
                    source,
                    lorebook_id: book.id.clone(),
                    lorebook_name: book.name.clone(),
                    entry: entry.clone(),
                }));
            }
        }
        merged
    }
}

// ============================================================================
// SillyTavern world-info import
// ============================================================================

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct StEntry {
    uid: Option<Value>,
    key: Vec<String>,
    keysecondary: Vec<String>,
    comment: String,
    content: String,
    constant: bool,
    selective: Option<bool>,
    selective_logic: Option<u8>,
    order: Option<i32>,
    position: Option<u8>,
    disable: bool,
    depth: Option<u32>,
    role: Option<u8>,
    exclude_recursion: bool,
    prevent_recursion: bool,
    group: String,
    group_override: bool,
    group_weight: Option<u32>,
    use_group_scoring: Option<bool>,
    case_sensitive: Option<bool>,
    match_whole_words: Option<bool>,
    display_index: Option<i32>,
}

#[derive(Deserialize)]
struct StWorldInfo {
    entries: serde_json::Map<String, Value>,
}

fn uid_string(uid: &Option<Value>, fallback: &str) -> String {
    match uid {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => fallback.to_string(),
    }
}

impl Lorebook {
    /// Imports a SillyTavern world-info export (`{"entries": {"0": {...}}}`).
    pub fn from_sillytavern_json(id: &str, name: &str, json: &str) -> Result<Self, ConfigError> {
        let world: StWorldInfo = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid(format!("world info JSON: {}", e)))?;

        let mut entries = Vec::with_capacity(world.entries.len());
        for (key, raw) in world.entries {
            let st: StEntry = serde_json::from_value(raw)
                .map_err(|e| ConfigError::Invalid(format!("world info entry '{}': {}", key, e)))?;

            let position = match st.position.unwrap_or(0) {
                1 | 3 | 6 => EntryPosition::AfterMain,
                4 => EntryPosition::AtDepth,
                _ => EntryPosition::BeforeMain,
            };
            let role = match st.role.unwrap_or(0) {
                1 => Role::User,
                2 => Role::Assistant,
                _ => Role::System,
            };
            let selective_logic = match st.selective_logic.unwrap_or(0) {
                1 => SelectiveLogic::NotAll,
                2 => SelectiveLogic::NotAny,
                3 => SelectiveLogic::AndAll,
                _ => SelectiveLogic::AndAny,
            };
            let secondary = if st.selective == Some(false) { Vec::new() } else { st.keysecondary };

            let id = uid_string(&st.uid, &key);
            entries.push(LorebookEntry {
                title: st.comment,
                enabled: !st.disable,
                always_active: st.constant,
                keywords: st.key,
                secondary_keywords: secondary,
                selective_logic,
                case_sensitive: st.case_sensitive,
                match_whole_words: st.match_whole_words,
                content: st.content,
                priority: st.order.unwrap_or_else(default_priority),
                display_order: st.display_index.unwrap_or(0),
                position,
                depth: st.depth.unwrap_or_else(default_depth),
                role,
                exclude_recursion: st.exclude_recursion,
                prevent_recursion: st.prevent_recursion,
                group: st.group,
                group_override: st.group_override,
                group_weight: st.group_weight.unwrap_or_else(default_group_weight),
                use_group_scoring: st.use_group_scoring,
                ..LorebookEntry::new(id, &[], "")
            });
        }

        entries.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| natural_id_cmp(&a.id, &b.id))
        });

        Ok(Lorebook {
            id: id.to_string(),
            name: name.to_string(),
            entries,
        })
    }
}

fn natural_id_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(id: &str, entries: Vec<LorebookEntry>) -> Lorebook {
        Lorebook {
            id: id.into(),
            name: format!("Book {}", id),
            entries,
        }
    }

    #[test]
    fn merge_orders_links_and_dedupes() {
        let shared = book("shared", vec![LorebookEntry::new("s1", &["x"], "shared")]);
        let mut disabled = LorebookEntry::new("c2", &["y"], "off");
        disabled.enabled = false;
        let linked = LinkedLorebooks {
            chat: vec![book("chat", vec![LorebookEntry::new("c1", &["a"], "chat")])],
            character: vec![shared.clone(), book("char", vec![disabled])],
            global: vec![shared],
            ..Default::default()
        };

        let merged = linked.merge();
        let ids: Vec<_> = merged.iter().map(|m| (m.source, m.entry.id.as_str())).collect();
        assert_eq!(
            ids,
            vec![(LorebookSource::Chat, "c1"), (LorebookSource::Character, "s1")]
        );
        assert_eq!(merged[1].label(), "Book shared / s1");
    }

    #[test]
    fn entry_json_accepts_aliases_and_defaults() {
        let json = r#"{"id": "e1", "keys": ["dragon"], "constant": false, "order": 7, "content": "Dragons fly."}"#;
        let entry: LorebookEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.keywords, vec!["dragon"]);
        assert_eq!(entry.priority, 7);
        assert!(entry.enabled);
        assert_eq!(entry.depth, 4);
        assert_eq!(entry.position, EntryPosition::BeforeMain);
    }

    #[test]
    fn imports_sillytavern_world_info() {
        let json = r#"{
            "entries": {
                "10": {"uid": 10, "key": ["castle"], "content": "A castle.", "order": 50, "position": 4, "depth": 2, "role": 1},
                "2": {"uid": 2, "key": ["moat"], "keysecondary": ["water"], "selectiveLogic": 3, "comment": "Moat", "content": "Deep.", "disable": true},
                "3": {"uid": 3, "key": [], "constant": true, "content": "Always.", "position": 1}
            }
        }"#;
        let book = Lorebook::from_sillytavern_json("wi", "World", json).unwrap();
        let ids: Vec<_> = book.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "10"]);

        let castle = &book.entries[2];
        assert_eq!(castle.position, EntryPosition::AtDepth);
        assert_eq!(castle.depth, 2);
        assert_eq!(castle.role, Role::User);
        assert_eq!(castle.priority, 50);

        let moat = &book.entries[0];
        assert!(!moat.enabled);
        assert_eq!(moat.selective_logic, SelectiveLogic::AndAll);
        assert_eq!(moat.display_name(), "Moat");

        assert!(book.entries[1].always_active);
        assert_eq!(book.entries[1].position, EntryPosition::AfterMain);
    }

    #[test]
    fn malformed_world_info_is_a_config_error() {
        let err = Lorebook::from_sillytavern_json("wi", "World", "{\"entries\": 3}").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
