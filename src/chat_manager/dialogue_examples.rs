//! Example-dialogue parsing.
//!
//! Character cards carry example conversations as one raw block where each
//! example starts with a `<START>` line and speaker lines look like
//! `Name: text`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::Role;

pub const EXAMPLE_MARKER: &str = "<START>";

lazy_static! {
    static ref MARKER_RE: Regex = Regex::new(r"(?i)<START>").expect("static regex");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExampleTurn {
    pub role: Role,
    pub speaker: String,
    pub content: String,
}

/// Splits a raw example block into one `<START>`-prefixed block per example.
/// Empty examples are dropped; feeding the joined output back in yields the
/// same blocks.
pub fn parse_dialogue_examples(raw: &str) -> Vec<String> {
    let raw = raw.replace("\r\n", "\n");
    if raw.trim().is_empty() {
        return Vec::new();
    }

    MARKER_RE
        .split(&raw)
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(|block| format!("{}\n{}\n", EXAMPLE_MARKER, block))
        .collect()
}

#[derive(Debug)]
enum Speaker<'a> {
    User,
    Character(&'a str),
}

struct TurnBuilder<'a> {
    speaker: Option<Speaker<'a>>,
    lines: Vec<&'a str>,
}

impl<'a> TurnBuilder<'a> {
    fn flush(&mut self, user_name: &str, is_group: bool, out: &mut Vec<ExampleTurn>) {
        let lines = std::mem::take(&mut self.lines);
        let Some(speaker) = self.speaker.take() else {
            // Narration before the first speaker line stays pending.
            self.lines = lines;
            return;
        };
        let content = lines.join("\n").trim().to_string();
        if content.is_empty() {
            return;
        }
        let (role, name) = match speaker {
            Speaker::User => (Role::User, user_name),
            Speaker::Character(name) => (Role::Assistant, name),
        };
        let content = if is_group {
            format!("{}: {}", name, content)
        } else {
            content
        };
        out.push(ExampleTurn {
            role,
            speaker: name.to_string(),
            content,
        });
    }
}

fn strip_speaker<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if name.is_empty() {
        return None;
    }
    line.strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
}

/// Turns parsed example blocks into role-tagged turns, one list per block.
/// Speaker prefixes are stripped; in group chats the speaker name is put back
/// in front of the content so members can be told apart.
pub fn parse_dialogue_examples_as_messages(
    blocks: &[String],
    user_name: &str,
    char_names: &[&str],
    is_group: bool,
) -> Vec<Vec<ExampleTurn>> {
    blocks
        .iter()
        .map(|block| {
            let body = MARKER_RE.replace_all(block, "");
            let mut turns = Vec::new();
            let mut current = TurnBuilder {
                speaker: None,
                lines: Vec::new(),
            };

            for line in body.lines() {
                let user_line = strip_speaker(line, user_name).or_else(|| strip_speaker(line, "{{user}}"));
                let char_line = char_names
                    .iter()
                    .find_map(|name| strip_speaker(line, name).map(|rest| (*name, rest)))
                    .or_else(|| {
                        strip_speaker(line, "{{char}}")
                            .map(|rest| (char_names.first().copied().unwrap_or("{{char}}"), rest))
                    });

                let (speaker, rest) = match (user_line, char_line) {
                    (Some(rest), _) => (Some(Speaker::User), rest),
                    (None, Some((name, rest))) => (Some(Speaker::Character(name)), rest),
                    (None, None) => (None, line),
                };

                match speaker {
                    Some(speaker) => {
                        current.flush(user_name, is_group, &mut turns);
                        current.speaker = Some(speaker);
                        current.lines.push(rest);
                    }
                    None => current.lines.push(rest),
                }
            }
            current.flush(user_name, is_group, &mut turns);
            turns
        })
        .collect()
}
