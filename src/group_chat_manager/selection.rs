//! Speaker selection strategies for group chats.
//!
//! This module handles:
//! - @mention parsing to detect when the user explicitly targets a member
//! - Name mentions in plain text
//! - The natural, list, pooled and manual activation strategies
//!
//! Every strategy is deterministic: randomness comes from an RNG seeded with
//! the chat id and the id of the last message on the branch.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::chat_manager::types::{Character, Message, Role};
use crate::utils::seeded_rng;

/// Talkativeness used when a card does not set one.
pub const DEFAULT_TALKATIVENESS: f32 = 0.5;

/// Everything a strategy looks at.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
    /// Enabled members in group order.
    pub members: &'a [&'a Character],
    pub branch: &'a [&'a Message],
    pub allow_self_responses: bool,
    pub chat_id: &'a str,
}

impl<'a> SelectionInput<'a> {
    fn last_message(&self) -> Option<&'a Message> {
        self.branch.last().copied()
    }

    /// Character id of the last assistant message on the branch.
    fn last_speaker(&self) -> Option<&'a str> {
        self.last_message()
            .filter(|m| m.role == Role::Assistant)
            .and_then(|m| m.character_id.as_deref())
    }

    /// The last speaker, unless members may answer themselves.
    fn banned(&self) -> Option<&'a str> {
        if self.allow_self_responses {
            None
        } else {
            self.last_speaker()
        }
    }

    fn rng(&self, strategy: &str) -> rand::rngs::StdRng {
        let tail = self.last_message().map(|m| m.id.as_str()).unwrap_or("");
        seeded_rng(&[self.chat_id, strategy, tail])
    }
}

// ============================================================================
// @Mention Parsing
// ============================================================================

/// Parse a message for @mentions and return the member id if found
///
/// Supports:
/// - @"Character Name" (quoted, for names with spaces)
/// - @CharacterName (unquoted, exact name first, then name prefix)
pub fn parse_mentions(message: &str, members: &[&Character]) -> Option<String> {
    let chars: Vec<char> = message.chars().collect();
    let mut i = 0;
    while i + 1 < chars.len() {
        if chars[i] == '@' && chars[i + 1] == '"' {
            let start = i + 2;
            let mut end = start;
            while end < chars.len() && chars[end] != '"' {
                end += 1;
            }
            if end > start && end < chars.len() {
                let mentioned: String = chars[start..end].iter().collect();
                let mentioned = mentioned.to_lowercase();
                if let Some(member) = members.iter().find(|c| c.name.to_lowercase() == mentioned) {
                    return Some(member.id.clone());
                }
            }
        }
        i += 1;
    }

    for word in message.split_whitespace() {
        let Some(mentioned) = word.strip_prefix('@') else {
            continue;
        };
        let mentioned = mentioned
            .trim_end_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if mentioned.is_empty() {
            continue;
        }
        if let Some(member) = members.iter().find(|c| c.name.to_lowercase() == mentioned) {
            return Some(member.id.clone());
        }
        if let Some(member) = members
            .iter()
            .find(|c| c.name.to_lowercase().starts_with(&mentioned))
        {
            return Some(member.id.clone());
        }
    }
    None
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Members any of whose name words appear in `text`, in order of first
/// appearance.
pub fn mentioned_by_name(text: &str, members: &[&Character]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for word in words(text) {
        for member in members {
            if found.contains(&member.id) {
                continue;
            }
            if words(&member.name).iter().any(|w| *w == word) {
                found.push(member.id.clone());
            }
        }
    }
    found
}

// ============================================================================
// Strategies
// ============================================================================

fn push_unique(out: &mut Vec<String>, id: &str) {
    if !out.iter().any(|existing| existing == id) {
        out.push(id.to_string());
    }
}

/// Mentions first, then name hits in the last message, then talkativeness
/// rolls, then one random member if nobody volunteered.
pub fn natural_order(input: &SelectionInput) -> Vec<String> {
    let banned = input.banned();
    let allowed = |id: &str| Some(id) != banned;
    let mut activated: Vec<String> = Vec::new();

    if let Some(last) = input.last_message() {
        let text = last.text_content();
        if last.is_user() {
            if let Some(id) = parse_mentions(&text, input.members) {
                if allowed(id.as_str()) {
                    push_unique(&mut activated, &id);
                }
            }
        }
        for id in mentioned_by_name(&text, input.members) {
            if allowed(id.as_str()) {
                push_unique(&mut activated, &id);
            }
        }
    }

    let mut rng = input.rng("natural");
    let mut shuffled: Vec<&Character> = input.members.to_vec();
    shuffled.shuffle(&mut rng);
    for member in &shuffled {
        let talkativeness = member.talkativeness.unwrap_or(DEFAULT_TALKATIVENESS).clamp(0.0, 1.0);
        let roll: f32 = rng.gen();
        if roll < talkativeness && allowed(member.id.as_str()) {
            push_unique(&mut activated, &member.id);
        }
    }

    if activated.is_empty() {
        let candidates: Vec<&Character> = input
            .members
            .iter()
            .copied()
            .filter(|m| allowed(m.id.as_str()))
            .collect();
        let pool = if candidates.is_empty() { input.members.to_vec() } else { candidates };
        if let Some(pick) = pool.choose(&mut rng) {
            push_unique(&mut activated, &pick.id);
        }
    }
    activated
}

/// Every enabled member, in group order.
pub fn list_order(input: &SelectionInput) -> Vec<String> {
    input.members.iter().map(|m| m.id.clone()).collect()
}

/// One member who has not spoken since the last user message; when everyone
/// has, anyone but the last speaker.
pub fn pooled_order(input: &SelectionInput) -> Vec<String> {
    let since_user = input
        .branch
        .iter()
        .rposition(|m| m.is_user())
        .map(|i| &input.branch[i + 1..])
        .unwrap_or(input.branch);
    let spoken: Vec<&str> = since_user
        .iter()
        .filter_map(|m| m.character_id.as_deref())
        .collect();

    let mut pool: Vec<&Character> = input
        .members
        .iter()
        .copied()
        .filter(|m| !spoken.contains(&m.id.as_str()))
        .collect();
    if pool.is_empty() {
        let last = input.last_speaker();
        pool = input
            .members
            .iter()
            .copied()
            .filter(|m| Some(m.id.as_str()) != last)
            .collect();
    }

    let mut rng = input.rng("pooled");
    pool.choose(&mut rng)
        .map(|m| vec![m.id.clone()])
        .unwrap_or_default()
}

/// Only an explicit @mention in the user's last message activates anyone.
pub fn manual_order(input: &SelectionInput) -> Vec<String> {
    input
        .last_message()
        .filter(|m| m.is_user())
        .and_then(|m| parse_mentions(&m.text_content(), input.members))
        .into_iter()
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
