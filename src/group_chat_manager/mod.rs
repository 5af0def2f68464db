//! Group Chat Manager
//!
//! This module decides who speaks next:
//! - A single character always answers alone
//! - Groups pick members with their configured activation strategy
//! - Muted members never activate
//! - Impersonation suppresses character selection entirely
//!
//! The engine holds the activated list for the current turn and walks it with
//! `next`/`advance`. It is session state: callers serialize turns.

mod selection;

use serde::Serialize;

use crate::chat_manager::types::{ActivationStrategy, Character, GroupContext, Message};

pub use selection::{
    list_order, manual_order, mentioned_by_name, natural_order, parse_mentions, pooled_order,
    SelectionInput, DEFAULT_TALKATIVENESS,
};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivatedCharacter {
    pub character: Character,
    pub accessed: bool,
}

/// Who the current chat is with.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatTarget {
    Single(Character),
    Group(GroupContext),
}

impl ChatTarget {
    /// Member ids, sorted, used to notice when the cast changes.
    fn member_ids(&self) -> Vec<String> {
        let mut ids = match self {
            ChatTarget::Single(c) => vec![c.id.clone()],
            ChatTarget::Group(g) => g.members.iter().map(|c| c.id.clone()).collect(),
        };
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    chat_id: String,
    member_ids: Vec<String>,
}

#[derive(Debug, Clone)]
struct Inputs {
    chat_id: String,
    target: ChatTarget,
    branch: Vec<Message>,
    impersonate: bool,
}

/// Characters chosen for one turn, in activation order.
pub fn activate(
    chat_id: &str,
    target: &ChatTarget,
    branch: &[&Message],
    impersonate: bool,
) -> Vec<Character> {
    if impersonate {
        tracing::debug!(target: "group_chat", chat_id, "impersonation, no character selected");
        return Vec::new();
    }

    let group = match target {
        ChatTarget::Single(character) => return vec![character.clone()],
        ChatTarget::Group(group) => group,
    };

    let members: Vec<&Character> = group.enabled_members().collect();
    if members.is_empty() {
        tracing::warn!(target: "group_chat", group = %group.group.name, "group has no enabled members");
        return Vec::new();
    }

    let input = SelectionInput {
        members: &members,
        branch,
        allow_self_responses: group.group.allow_self_responses,
        chat_id,
    };
    let ids = match group.group.activation_strategy {
        ActivationStrategy::Natural => natural_order(&input),
        ActivationStrategy::List => list_order(&input),
        ActivationStrategy::Pooled => pooled_order(&input),
        ActivationStrategy::Manual => manual_order(&input),
    };

    let activated: Vec<Character> = ids
        .iter()
        .filter_map(|id| members.iter().find(|m| &m.id == id).map(|m| (*m).clone()))
        .collect();
    tracing::info!(
        target: "group_chat",
        group = %group.group.name,
        strategy = ?group.group.activation_strategy,
        activated = ?activated.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        "group members activated"
    );
    activated
}

// ============================================================================
// Activation Engine
// ============================================================================

#[derive(Debug, Default)]
pub struct ActivationEngine {
    entries: Vec<ActivatedCharacter>,
    identity: Option<Identity>,
    inputs: Option<Inputs>,
}

impl ActivationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the activated list for the given chat and marks every entry
    /// unaccessed.
    pub fn activate(
        &mut self,
        chat_id: &str,
        target: &ChatTarget,
        branch: &[&Message],
        impersonate: bool,
    ) -> Vec<Character> {
        self.inputs = Some(Inputs {
            chat_id: chat_id.to_string(),
            target: target.clone(),
            branch: branch.iter().map(|m| (*m).clone()).collect(),
            impersonate,
        });
        self.identity = Some(Identity {
            chat_id: chat_id.to_string(),
            member_ids: target.member_ids(),
        });
        self.recompute();
        self.entries.iter().map(|e| e.character.clone()).collect()
    }

    /// Re-activates when the chat or its cast differ from the last call.
    /// Returns whether a recompute happened.
    pub fn sync(&mut self, chat_id: &str, target: &ChatTarget, branch: &[&Message]) -> bool {
        let identity = Identity {
            chat_id: chat_id.to_string(),
            member_ids: target.member_ids(),
        };
        if self.identity.as_ref() == Some(&identity) {
            return false;
        }
        tracing::debug!(target: "group_chat", chat_id, "chat identity changed, recomputing activation");
        self.activate(chat_id, target, branch, false);
        true
    }

    fn recompute(&mut self) {
        let Some(inputs) = &self.inputs else {
            self.entries.clear();
            return;
        };
        let branch: Vec<&Message> = inputs.branch.iter().collect();
        self.entries = activate(&inputs.chat_id, &inputs.target, &branch, inputs.impersonate)
            .into_iter()
            .map(|character| ActivatedCharacter {
                character,
                accessed: false,
            })
            .collect();
    }

    fn head(&self) -> Option<&ActivatedCharacter> {
        self.entries.iter().find(|e| !e.accessed)
    }

    /// The first character that has not answered yet. With `reset`, or once
    /// everyone has answered, activation is recomputed and tried once more.
    pub fn next(&mut self, reset: bool) -> Option<Character> {
        if !reset {
            if let Some(entry) = self.head() {
                return Some(entry.character.clone());
            }
        }
        self.recompute();
        self.head().map(|e| e.character.clone())
    }

    /// Marks the current head as answered and reports whether anyone is left.
    pub fn advance(&mut self) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| !e.accessed) {
            entry.accessed = true;
        }
        self.head().is_some()
    }

    pub fn entries(&self) -> &[ActivatedCharacter] {
        &self.entries
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_manager::types::{Group, Role};

    fn cast() -> Vec<Character> {
        ["Alice", "Bob", "Cara"]
            .iter()
            .map(|name| Character {
                id: name.to_lowercase(),
                name: name.to_string(),
                talkativeness: Some(0.0),
                ..Default::default()
            })
            .collect()
    }

    fn group(strategy: ActivationStrategy, muted: &[&str]) -> ChatTarget {
        let characters = cast();
        ChatTarget::Group(GroupContext::new(
            Group {
                id: "g".into(),
                name: "Party".into(),
                members: characters.iter().map(|c| c.id.clone()).collect(),
                disabled_members: muted.iter().map(|s| s.to_string()).collect(),
                activation_strategy: strategy,
                allow_self_responses: false,
            },
            &characters,
        ))
    }

    #[test]
    fn single_character_answers_alone() {
        let alice = cast().remove(0);
        let target = ChatTarget::Single(alice.clone());
        assert_eq!(activate("c", &target, &[], false), vec![alice]);
        assert!(activate("c", &target, &[], true).is_empty());
    }

    #[test]
    fn advance_returns_false_on_the_nth_call() {
        let target = group(ActivationStrategy::List, &[]);
        let mut engine = ActivationEngine::new();
        let activated = engine.activate("c", &target, &[], false);
        assert_eq!(activated.len(), 3);

        assert_eq!(engine.next(false).map(|c| c.id), Some("alice".to_string()));
        assert!(engine.advance());
        assert_eq!(engine.next(false).map(|c| c.id), Some("bob".to_string()));
        assert!(engine.advance());
        assert!(!engine.advance());
        assert!(!engine.advance());
    }

    #[test]
    fn reset_starts_a_fresh_cycle() {
        let target = group(ActivationStrategy::List, &[]);
        let mut engine = ActivationEngine::new();
        engine.activate("c", &target, &[], false);
        engine.advance();
        engine.advance();
        assert_eq!(engine.next(true).map(|c| c.id), Some("alice".to_string()));
        assert!(engine.entries().iter().all(|e| !e.accessed));

        for _ in 0..3 {
            engine.advance();
        }
        assert_eq!(engine.next(false).map(|c| c.id), Some("alice".to_string()));
    }

    #[test]
    fn muted_members_never_activate() {
        let target = group(ActivationStrategy::List, &["bob"]);
        let ids: Vec<String> = activate("c", &target, &[], false).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["alice", "cara"]);

        let all_muted = group(ActivationStrategy::Natural, &["alice", "bob", "cara"]);
        let mut engine = ActivationEngine::new();
        engine.activate("c", &all_muted, &[], false);
        assert!(engine.next(false).is_none());
        assert!(!engine.advance());
    }

    #[test]
    fn impersonation_suppresses_selection() {
        let target = group(ActivationStrategy::List, &[]);
        let mut engine = ActivationEngine::new();
        assert!(engine.activate("c", &target, &[], true).is_empty());
        assert!(engine.next(false).is_none());
    }

    #[test]
    fn sync_recomputes_only_on_identity_change() {
        let target = group(ActivationStrategy::List, &[]);
        let mut engine = ActivationEngine::new();
        assert!(engine.sync("c1", &target, &[]));
        engine.advance();
        assert!(!engine.sync("c1", &target, &[]));
        assert!(engine.entries()[0].accessed);
        assert!(engine.sync("c2", &target, &[]));
        assert!(!engine.entries()[0].accessed);
    }

    #[test]
    fn natural_strategy_follows_the_branch() {
        let target = group(ActivationStrategy::Natural, &[]);
        let m1 = Message::text(Role::User, "01", "Cara, your turn");
        let ids: Vec<String> = activate("c", &target, &[&m1], false).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["cara"]);
    }
}
