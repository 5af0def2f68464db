use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Time-ordered message identifier. Ids compare lexicographically, and ids
/// produced by [`MessageId::generate`] sort in creation order, so "greatest id"
/// doubles as "most recent".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
    File { name: String, url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    /// Display name of the speaker (character or persona) at the time of sending.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub character_id: Option<String>,
}

impl Message {
    pub fn text(role: Role, id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(id),
            role,
            content: vec![ContentPart::Text { text: text.into() }],
            annotations: Vec::new(),
            parent_id: None,
            name: None,
            character_id: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_id = Some(MessageId::new(parent));
        self
    }

    pub fn with_speaker(mut self, name: impl Into<String>, character_id: Option<&str>) -> Self {
        self.name = Some(name.into());
        self.character_id = character_id.map(str::to_string);
        self
    }

    /// Text parts joined with newlines; non-text parts are skipped.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    /// Raw example-dialogue block (`<START>`-separated).
    pub mes_example: String,
    pub first_messages: Vec<String>,
    /// Chance (0.0–1.0) of joining a natural-order group turn.
    pub talkativeness: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ActivationStrategy {
    #[default]
    Natural,
    List,
    Pooled,
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Group {
    pub id: String,
    pub name: String,
    /// Member character ids in group order.
    pub members: Vec<String>,
    pub disabled_members: Vec<String>,
    pub activation_strategy: ActivationStrategy,
    pub allow_self_responses: bool,
}

impl Group {
    pub fn is_enabled(&self, character_id: &str) -> bool {
        !self.disabled_members.iter().any(|id| id == character_id)
    }
}

/// A group together with the resolved member cards, in group order.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupContext {
    pub group: Group,
    pub members: Vec<Character>,
}

impl GroupContext {
    pub fn new(group: Group, characters: &[Character]) -> Self {
        let members = group
            .members
            .iter()
            .filter_map(|id| characters.iter().find(|c| &c.id == id).cloned())
            .collect();
        Self { group, members }
    }

    pub fn enabled_members(&self) -> impl Iterator<Item = &Character> {
        self.members
            .iter()
            .filter(move |c| self.group.is_enabled(&c.id))
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// Total context window in tokens.
    pub context_length: u32,
    /// Tokens reserved for the reply.
    #[serde(default)]
    pub max_output_tokens: u32,
}

impl Model {
    pub fn available_context(&self) -> u32 {
        self.context_length.saturating_sub(self.max_output_tokens)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chat {
    pub id: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum GenerateType {
    #[default]
    Normal,
    Regenerate,
    Continue,
    Impersonate,
    Quiet,
}
