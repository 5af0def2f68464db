//! Lorebook scanning.
//!
//! Activation is synchronous: constants always fire, keyword entries fire when
//! their keys appear in the scan buffer (recent chat plus, when recursion is
//! on, the content of entries activated in earlier passes). The ordered result
//! is then walked against the token budget, which is the only async step.

use regex::{Regex, RegexBuilder};
use std::collections::HashSet;

use super::lorebook::{EntryPosition, LorebookSource, MergedEntry, SelectiveLogic};
use super::prompts::apply_format;
use super::types::Role;
use crate::error::TokenCountError;
use crate::settings::{InsertionStrategy, WorldInfoSettings};
use crate::tokenizer::TokenCounter;

/// One chat message as seen by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanMessage<'a> {
    pub speaker: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedPosition {
    BeforeMain,
    AfterMain,
    AtDepth { depth: u32, role: Role },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivatedEntry {
    pub id: String,
    pub label: String,
    pub content: String,
    pub position: ResolvedPosition,
    pub source: LorebookSource,
    pub priority: i32,
    pub display_order: i32,
    /// Index in the merged entry list; final tie-breaker.
    pub seq: usize,
    pub tokens: u32,
}

impl ActivatedEntry {
    fn from_merged(merged: &MergedEntry, seq: usize) -> Self {
        let entry = &merged.entry;
        let position = match entry.position {
            EntryPosition::BeforeMain => ResolvedPosition::BeforeMain,
            EntryPosition::AfterMain => ResolvedPosition::AfterMain,
            EntryPosition::AtDepth => ResolvedPosition::AtDepth {
                depth: entry.depth,
                role: entry.role,
            },
        };
        Self {
            id: entry.id.clone(),
            label: merged.label(),
            content: entry.content.clone(),
            position,
            source: merged.source,
            priority: entry.priority,
            display_order: entry.display_order,
            seq,
            tokens: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    /// Activated entries in insertion order.
    pub entries: Vec<ActivatedEntry>,
    pub recursion_steps: u32,
    pub scan_depth_used: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BudgetResult {
    pub entries: Vec<ActivatedEntry>,
    pub dropped: Vec<String>,
    pub total_tokens: u32,
    /// Set only when entries were dropped and `alertOnOverflow` is on.
    pub overflow_alert: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LorebookOutcome {
    pub entries: Vec<ActivatedEntry>,
    pub dropped: Vec<String>,
    pub total_tokens: u32,
    pub overflow_alert: bool,
    pub recursion_steps: u32,
    pub scan_depth_used: usize,
}

impl LorebookOutcome {
    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.label.clone()).collect()
    }

    pub fn at(&self, position: EntryPosition) -> impl Iterator<Item = &ActivatedEntry> {
        self.entries.iter().filter(move |e| {
            matches!(
                (position, e.position),
                (EntryPosition::BeforeMain, ResolvedPosition::BeforeMain)
                    | (EntryPosition::AfterMain, ResolvedPosition::AfterMain)
                    | (EntryPosition::AtDepth, ResolvedPosition::AtDepth { .. })
            )
        })
    }
}

/// Joins entry contents for one prompt slot, each wrapped in the world info
/// format template.
pub fn format_lorebook_for_prompt<'a>(
    entries: impl IntoIterator<Item = &'a ActivatedEntry>,
    wi_format: &str,
) -> String {
    entries
        .into_iter()
        .map(|entry| entry.content.trim())
        .filter(|content| !content.is_empty())
        .map(|content| apply_format(wi_format, content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ============================================================================
// Key matching
// ============================================================================

fn normalize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// The scan buffer in the shapes key matching needs.
struct Haystack {
    raw: String,
    lower: String,
    words_raw: String,
    words_lower: String,
}

impl Haystack {
    fn new(raw: String) -> Self {
        let lower = raw.to_lowercase();
        Self {
            words_raw: format!(" {} ", normalize(&raw)),
            words_lower: format!(" {} ", normalize(&lower)),
            raw,
            lower,
        }
    }
}

/// `/pattern/flags` keys. `Some(None)` is a regex key that failed to compile.
fn regex_key(key: &str) -> Option<Option<Regex>> {
    if key.len() < 3 || !key.starts_with('/') {
        return None;
    }
    let close = key.rfind('/')?;
    if close == 0 {
        return None;
    }
    let (pattern, flags) = (&key[1..close], &key[close + 1..]);
    if pattern.is_empty() || !flags.chars().all(|c| "gimsuy".contains(c)) {
        return None;
    }
    let compiled = RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build();
    match compiled {
        Ok(re) => Some(Some(re)),
        Err(e) => {
            tracing::debug!(target: "lorebook", key, error = %e, "invalid regex key never matches");
            Some(None)
        }
    }
}

fn key_matches(key: &str, hay: &Haystack, case_sensitive: bool, whole_words: bool) -> bool {
    let key = key.trim();
    if key.is_empty() {
        return false;
    }

    if let Some(re) = regex_key(key) {
        return re.map_or(false, |re| re.is_match(&hay.raw));
    }

    let (keyword, text, words) = if case_sensitive {
        (key.to_string(), hay.raw.as_str(), hay.words_raw.as_str())
    } else {
        (key.to_lowercase(), hay.lower.as_str(), hay.words_lower.as_str())
    };

    if let Some(prefix) = keyword.strip_suffix('*') {
        let prefix = normalize(prefix);
        if prefix.is_empty() {
            return false;
        }
        // Prefix of a word, or of a run of words when the key has spaces.
        return words.contains(&format!(" {}", prefix));
    }

    if whole_words {
        let normalized = normalize(&keyword);
        if normalized.is_empty() {
            return false;
        }
        return words.contains(&format!(" {} ", normalized));
    }

    text.contains(&keyword)
}

// ============================================================================
// Scanner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Initial,
    Recursion,
    MinActivations,
}

pub struct LorebookScanner<'a> {
    entries: &'a [MergedEntry],
    settings: &'a WorldInfoSettings,
}

impl<'a> LorebookScanner<'a> {
    pub fn new(entries: &'a [MergedEntry], settings: &'a WorldInfoSettings) -> Self {
        Self { entries, settings }
    }

    fn build_buffer(&self, history: &[ScanMessage], depth: usize) -> String {
        let start = history.len().saturating_sub(depth);
        history[start..]
            .iter()
            .map(|m| {
                if self.settings.include_names && !m.speaker.is_empty() {
                    format!("{}: {}", m.speaker, m.text)
                } else {
                    m.text.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Key-match score of an entry, `None` when it does not activate.
    fn match_score(&self, merged: &MergedEntry, hay: &Haystack) -> Option<usize> {
        let entry = &merged.entry;
        if entry.always_active {
            return Some(0);
        }
        let case_sensitive = entry.case_sensitive.unwrap_or(self.settings.case_sensitive);
        let whole_words = entry.match_whole_words.unwrap_or(self.settings.match_whole_words);
        let hit = |key: &str| key_matches(key, hay, case_sensitive, whole_words);

        let primary = entry.keywords.iter().filter(|k| hit(k.as_str())).count();
        if primary == 0 {
            return None;
        }

        let secondary: Vec<&String> = entry
            .secondary_keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .collect();
        if secondary.is_empty() {
            return Some(primary);
        }
        let matched = secondary.iter().filter(|k| hit(k.as_str())).count();
        let passes = match entry.selective_logic {
            SelectiveLogic::AndAny => matched > 0,
            SelectiveLogic::AndAll => matched == secondary.len(),
            SelectiveLogic::NotAny => matched == 0,
            SelectiveLogic::NotAll => matched < secondary.len(),
        };
        passes.then_some(primary + matched)
    }

    /// At most one member of each inclusion group survives, and none once the
    /// group already has an active member.
    fn resolve_groups(&self, candidates: Vec<(usize, usize)>, chosen: &mut HashSet<String>) -> Vec<usize> {
        let mut kept = Vec::new();
        let mut groups: Vec<(String, Vec<(usize, usize)>)> = Vec::new();

        for (idx, score) in candidates {
            let label = self.entries[idx].entry.group.trim();
            if label.is_empty() {
                kept.push(idx);
                continue;
            }
            match groups.iter_mut().find(|(name, _)| name == label) {
                Some((_, members)) => members.push((idx, score)),
                None => groups.push((label.to_string(), vec![(idx, score)])),
            }
        }

        for (label, members) in groups {
            if chosen.contains(&label) {
                tracing::debug!(target: "lorebook", group = %label, "inclusion group already has an active entry");
                continue;
            }

            let overrides: Vec<(usize, usize)> = members
                .iter()
                .copied()
                .filter(|(i, _)| self.entries[*i].entry.group_override)
                .collect();
            let mut pool = if overrides.is_empty() { members } else { overrides };

            let scoring = pool.iter().any(|(i, _)| {
                self.entries[*i]
                    .entry
                    .use_group_scoring
                    .unwrap_or(self.settings.use_group_scoring)
            });
            if scoring {
                let best = pool.iter().map(|(_, s)| *s).max().unwrap_or(0);
                pool.retain(|(_, s)| *s == best);
            }

            let winner = pool.iter().map(|(i, _)| *i).max_by(|a, b| {
                let (ea, eb) = (&self.entries[*a].entry, &self.entries[*b].entry);
                ea.group_weight
                    .cmp(&eb.group_weight)
                    .then(ea.priority.cmp(&eb.priority))
                    .then(b.cmp(a))
            });
            if let Some(winner) = winner {
                chosen.insert(label);
                kept.push(winner);
            }
        }

        kept.sort_unstable();
        kept
    }

    pub fn scan(&self, history: &[ScanMessage]) -> ScanResult {
        let settings = self.settings;
        let max_depth = match settings.max_depth {
            0 => history.len(),
            n => n.min(history.len()),
        };
        let mut depth = settings.scan_depth.min(history.len());
        let mut chat_buffer = self.build_buffer(history, depth);
        let mut recursion_buffer = String::new();

        let mut activated: Vec<usize> = Vec::new();
        let mut active_set: HashSet<usize> = HashSet::new();
        let mut chosen_groups: HashSet<String> = HashSet::new();
        let mut recursion_steps = 0u32;
        let mut pass = Pass::Initial;

        loop {
            // Recursion-excluded entries only ever see the chat itself.
            let chat_hay = Haystack::new(chat_buffer.clone());
            let full_hay = (!recursion_buffer.is_empty())
                .then(|| Haystack::new(format!("{}\n{}", chat_buffer, recursion_buffer)));

            let candidates: Vec<(usize, usize)> = self
                .entries
                .iter()
                .enumerate()
                .filter(|(i, _)| !active_set.contains(i))
                .filter_map(|(i, m)| {
                    let hay = match &full_hay {
                        Some(full) if !m.entry.exclude_recursion => full,
                        _ => &chat_hay,
                    };
                    self.match_score(m, hay).map(|score| (i, score))
                })
                .collect();
            let fresh = self.resolve_groups(candidates, &mut chosen_groups);
            tracing::debug!(target: "lorebook", ?pass, depth, activated = fresh.len(), "scan pass");

            let mut recursion_text = Vec::new();
            for &idx in &fresh {
                active_set.insert(idx);
                activated.push(idx);
                let entry = &self.entries[idx].entry;
                if !entry.prevent_recursion && !entry.content.trim().is_empty() {
                    recursion_text.push(entry.content.as_str());
                }
            }

            let steps_left = settings.max_recursion_steps == 0 || recursion_steps < settings.max_recursion_steps;
            if settings.recursive_scan && !recursion_text.is_empty() && steps_left {
                if !recursion_buffer.is_empty() {
                    recursion_buffer.push('\n');
                }
                recursion_buffer.push_str(&recursion_text.join("\n"));
                recursion_steps += 1;
                pass = Pass::Recursion;
                continue;
            }

            if settings.min_activations > 0 && activated.len() < settings.min_activations && depth < max_depth {
                depth += 1;
                chat_buffer = self.build_buffer(history, depth);
                pass = Pass::MinActivations;
                continue;
            }
            break;
        }

        let entries = self.order(
            activated
                .into_iter()
                .map(|i| ActivatedEntry::from_merged(&self.entries[i], i))
                .collect(),
        );
        tracing::info!(
            target: "lorebook",
            count = entries.len(),
            recursion_steps,
            depth,
            entries = ?entries.iter().map(|e| e.label.as_str()).collect::<Vec<_>>(),
            "lorebook entries activated"
        );

        ScanResult {
            entries,
            recursion_steps,
            scan_depth_used: depth,
        }
    }

    fn order(&self, mut entries: Vec<ActivatedEntry>) -> Vec<ActivatedEntry> {
        let rank = |e: &ActivatedEntry| -> u8 {
            let is_character = e.source == LorebookSource::Character;
            match self.settings.insertion_strategy {
                InsertionStrategy::Evenly => 0,
                InsertionStrategy::CharacterFirst => u8::from(!is_character),
                InsertionStrategy::GlobalFirst => u8::from(is_character),
            }
        };
        entries.sort_by(|a, b| {
            rank(a)
                .cmp(&rank(b))
                .then(b.priority.cmp(&a.priority))
                .then(a.display_order.cmp(&b.display_order))
                .then(a.seq.cmp(&b.seq))
        });
        entries
    }

    /// Keeps entries in order while their summed cost fits the budget. The
    /// first entry that does not fit ends the walk; it and everything after it
    /// is dropped.
    pub async fn apply_budget(
        &self,
        entries: Vec<ActivatedEntry>,
        max_context: u32,
        model_id: &str,
        counter: &dyn TokenCounter,
    ) -> Result<BudgetResult, TokenCountError> {
        let budget = self.settings.effective_budget(max_context);
        let mut result = BudgetResult::default();
        let mut overflowed = false;

        for mut entry in entries {
            if overflowed {
                result.dropped.push(entry.label);
                continue;
            }
            let cost = counter.count_tokens(&entry.content, model_id).await?;
            entry.tokens = cost;
            match budget {
                Some(limit) if result.total_tokens + cost > limit => {
                    overflowed = true;
                    result.dropped.push(entry.label);
                }
                _ => {
                    result.total_tokens += cost;
                    result.entries.push(entry);
                }
            }
        }

        if overflowed {
            tracing::warn!(
                target: "lorebook",
                budget = ?budget,
                kept = result.entries.len(),
                dropped = ?result.dropped,
                "lorebook budget exceeded"
            );
            result.overflow_alert = self.settings.alert_on_overflow;
        }
        Ok(result)
    }
}

/// Scan and budget in one step, with entry content used as-is.
pub async fn scan_lorebooks(
    entries: &[MergedEntry],
    history: &[ScanMessage<'_>],
    settings: &WorldInfoSettings,
    max_context: u32,
    model_id: &str,
    counter: &dyn TokenCounter,
) -> Result<LorebookOutcome, TokenCountError> {
    let scanner = LorebookScanner::new(entries, settings);
    let scanned = scanner.scan(history);
    let budgeted = scanner
        .apply_budget(scanned.entries, max_context, model_id, counter)
        .await?;
    Ok(LorebookOutcome {
        entries: budgeted.entries,
        dropped: budgeted.dropped,
        total_tokens: budgeted.total_tokens,
        overflow_alert: budgeted.overflow_alert,
        recursion_steps: scanned.recursion_steps,
        scan_depth_used: scanned.scan_depth_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_manager::lorebook::{LinkedLorebooks, Lorebook, LorebookEntry};
    use async_trait::async_trait;

    struct WordCounter;

    #[async_trait]
    impl TokenCounter for WordCounter {
        async fn count_tokens(&self, text: &str, _model_id: &str) -> Result<u32, TokenCountError> {
            Ok(text.split_whitespace().count() as u32)
        }
    }

    fn merged(source: LorebookSource, entries: Vec<LorebookEntry>) -> Vec<MergedEntry> {
        entries
            .into_iter()
            .map(|entry| MergedEntry {
                source,
                lorebook_id: format!("{:?}", source),
                lorebook_name: format!("{:?}", source),
                entry,
            })
            .collect()
    }

    fn unlimited() -> WorldInfoSettings {
        WorldInfoSettings {
            context: 0,
            budget_cap: 0,
            ..Default::default()
        }
    }

    fn say(text: &str) -> ScanMessage<'_> {
        ScanMessage { speaker: "", text }
    }

    fn ids(entries: &[ActivatedEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    #[tokio::test]
    async fn constant_and_keyword_entries_activate_in_strategy_order() {
        let linked = LinkedLorebooks {
            character: vec![Lorebook {
                id: "c".into(),
                name: "Char".into(),
                entries: vec![LorebookEntry::new("sword", &["sword"], "A blade.")],
            }],
            global: vec![Lorebook {
                id: "g".into(),
                name: "Global".into(),
                entries: vec![LorebookEntry::constant("always", "The world is round.")],
            }],
            ..Default::default()
        };
        let entries = linked.merge();
        let history = [say("I draw my sword")];

        let mut settings = unlimited();
        settings.insertion_strategy = InsertionStrategy::GlobalFirst;
        let outcome = scan_lorebooks(&entries, &history, &settings, 4096, "m", &WordCounter).await.unwrap();
        assert_eq!(ids(&outcome.entries), vec!["always", "sword"]);
        assert_eq!(outcome.labels(), vec!["Global / always", "Char / sword"]);

        settings.insertion_strategy = InsertionStrategy::CharacterFirst;
        let outcome = scan_lorebooks(&entries, &history, &settings, 4096, "m", &WordCounter).await.unwrap();
        assert_eq!(ids(&outcome.entries), vec!["sword", "always"]);
    }

    #[test]
    fn key_forms() {
        let hay = Haystack::new("The Dragonborn met a dragon near Whiterun.".to_string());
        assert!(key_matches("dragon", &hay, false, false));
        assert!(key_matches("DRAGON", &hay, false, true));
        assert!(!key_matches("DRAGON", &hay, true, false));
        assert!(!key_matches("dragonb", &hay, false, true));
        assert!(key_matches("white*", &hay, false, false));
        assert!(key_matches("/dragon(born)?/i", &hay, false, false));
        assert!(!key_matches("/[unclosed/", &hay, false, false));
        assert!(!key_matches("   ", &hay, false, false));
        assert!(!key_matches("*", &hay, false, false));
        assert!(key_matches("near whiterun", &hay, false, true));
        assert!(key_matches("near white*", &hay, false, false));
        assert!(key_matches("a drag*", &hay, false, true));
        assert!(!key_matches("near whiterun gate*", &hay, false, false));
        assert!(!key_matches("ragon*", &hay, false, false));
    }

    #[test]
    fn per_entry_case_override_wins() {
        let mut strict = LorebookEntry::new("strict", &["Alice"], "x");
        strict.case_sensitive = Some(true);
        let entries = merged(LorebookSource::Global, vec![strict]);
        let settings = unlimited();
        let scanner = LorebookScanner::new(&entries, &settings);
        assert!(scanner.scan(&[say("alice waves")]).entries.is_empty());
        assert_eq!(scanner.scan(&[say("Alice waves")]).entries.len(), 1);
    }

    #[test]
    fn secondary_key_logic() {
        let make = |id: &str, logic| {
            let mut e = LorebookEntry::new(id, &["castle"], "x");
            e.secondary_keywords = vec!["night".into(), "rain".into()];
            e.selective_logic = logic;
            e
        };
        let entries = merged(
            LorebookSource::Global,
            vec![
                make("any", SelectiveLogic::AndAny),
                make("all", SelectiveLogic::AndAll),
                make("not_any", SelectiveLogic::NotAny),
                make("not_all", SelectiveLogic::NotAll),
            ],
        );
        let settings = unlimited();
        let scanner = LorebookScanner::new(&entries, &settings);
        let result = scanner.scan(&[say("the castle at night")]);
        let mut got = ids(&result.entries);
        got.sort();
        assert_eq!(got, vec!["any", "not_all"]);
    }

    #[test]
    fn recursion_follows_chains_and_terminates_on_cycles() {
        let entries = merged(
            LorebookSource::Global,
            vec![
                LorebookEntry::new("a", &["alpha"], "alpha mentions beta"),
                LorebookEntry::new("b", &["beta"], "beta mentions gamma and alpha"),
                LorebookEntry::new("c", &["gamma"], "gamma mentions alpha"),
            ],
        );
        let mut settings = unlimited();
        let scanner = LorebookScanner::new(&entries, &settings);
        let result = scanner.scan(&[say("tell me about alpha")]);
        assert_eq!(result.entries.len(), 3);
        assert_eq!(result.recursion_steps, 3);

        settings.max_recursion_steps = 1;
        let scanner = LorebookScanner::new(&entries, &settings);
        let result = scanner.scan(&[say("tell me about alpha")]);
        let mut got = ids(&result.entries);
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
        assert_eq!(result.recursion_steps, 1);

        settings.recursive_scan = false;
        let scanner = LorebookScanner::new(&entries, &settings);
        assert_eq!(ids(&scanner.scan(&[say("alpha")]).entries), vec!["a"]);
    }

    #[test]
    fn recursion_flags_are_honoured() {
        let mut quiet = LorebookEntry::new("quiet", &["alpha"], "beta");
        quiet.prevent_recursion = true;
        let mut excluded = LorebookEntry::new("excluded", &["gamma"], "x");
        excluded.exclude_recursion = true;
        let entries = merged(
            LorebookSource::Global,
            vec![
                quiet,
                LorebookEntry::new("beta", &["beta"], "gamma"),
                excluded,
                LorebookEntry::new("loud", &["delta"], "gamma"),
            ],
        );
        let settings = unlimited();
        let scanner = LorebookScanner::new(&entries, &settings);
        assert_eq!(ids(&scanner.scan(&[say("alpha")]).entries), vec!["quiet"]);
        assert_eq!(ids(&scanner.scan(&[say("delta")]).entries), vec!["loud"]);
    }

    #[test]
    fn min_activations_widen_the_window() {
        let entries = merged(
            LorebookSource::Global,
            vec![LorebookEntry::new("old", &["ancient"], "x")],
        );
        let history = [say("an ancient ruin"), say("hello"), say("how are you")];
        let mut settings = unlimited();
        settings.scan_depth = 1;
        let scanner = LorebookScanner::new(&entries, &settings);
        assert!(scanner.scan(&history).entries.is_empty());

        settings.min_activations = 1;
        let scanner = LorebookScanner::new(&entries, &settings);
        let result = scanner.scan(&history);
        assert_eq!(ids(&result.entries), vec!["old"]);
        assert_eq!(result.scan_depth_used, 3);

        settings.max_depth = 2;
        let scanner = LorebookScanner::new(&entries, &settings);
        let result = scanner.scan(&history);
        assert!(result.entries.is_empty());
        assert_eq!(result.scan_depth_used, 2);
    }

    #[test]
    fn widened_window_keeps_recursion_exclusion() {
        let mut excluded = LorebookEntry::new("x", &["gamma"], "x");
        excluded.exclude_recursion = true;
        let entries = merged(
            LorebookSource::Global,
            vec![LorebookEntry::new("a", &["alpha"], "gamma"), excluded],
        );
        let mut settings = unlimited();
        settings.scan_depth = 1;
        settings.min_activations = 5;
        let scanner = LorebookScanner::new(&entries, &settings);

        let result = scanner.scan(&[say("nothing here"), say("alpha")]);
        assert_eq!(ids(&result.entries), vec!["a"]);
        assert_eq!(result.scan_depth_used, 2);

        let result = scanner.scan(&[say("gamma rays"), say("alpha")]);
        let mut got = ids(&result.entries);
        got.sort();
        assert_eq!(got, vec!["a", "x"]);
    }

    #[test]
    fn inclusion_groups_pick_one_member() {
        let grouped = |id: &str, weight: u32, over: bool| {
            let mut e = LorebookEntry::new(id, &["weather"], id);
            e.group = "weather".into();
            e.group_weight = weight;
            e.group_override = over;
            e
        };
        let entries = merged(
            LorebookSource::Global,
            vec![grouped("sun", 10, false), grouped("rain", 50, false), grouped("snow", 1, true)],
        );
        let settings = unlimited();
        let scanner = LorebookScanner::new(&entries, &settings);
        assert_eq!(ids(&scanner.scan(&[say("weather")]).entries), vec!["snow"]);

        let entries = merged(
            LorebookSource::Global,
            vec![grouped("sun", 10, false), grouped("rain", 50, false)],
        );
        let scanner = LorebookScanner::new(&entries, &settings);
        assert_eq!(ids(&scanner.scan(&[say("weather")]).entries), vec!["rain"]);
    }

    #[test]
    fn group_scoring_prefers_more_key_hits() {
        let mut a = LorebookEntry::new("a", &["storm"], "x");
        a.group = "g".into();
        a.group_weight = 100;
        let mut b = LorebookEntry::new("b", &["storm", "thunder"], "y");
        b.group = "g".into();
        b.group_weight = 1;
        let entries = merged(LorebookSource::Global, vec![a, b]);
        let mut settings = unlimited();
        settings.use_group_scoring = true;
        let scanner = LorebookScanner::new(&entries, &settings);
        assert_eq!(ids(&scanner.scan(&[say("storm and thunder")]).entries), vec!["b"]);
    }

    #[test]
    fn include_names_scans_speaker_names() {
        let entries = merged(LorebookSource::Global, vec![LorebookEntry::new("bob", &["bob"], "x")]);
        let history = [ScanMessage { speaker: "Bob", text: "hi" }];
        let mut settings = unlimited();
        let scanner = LorebookScanner::new(&entries, &settings);
        assert_eq!(scanner.scan(&history).entries.len(), 1);
        settings.include_names = false;
        let scanner = LorebookScanner::new(&entries, &settings);
        assert!(scanner.scan(&history).entries.is_empty());
    }

    #[tokio::test]
    async fn budget_is_never_exceeded() {
        let mut book = Vec::new();
        for i in 0..6 {
            let mut e = LorebookEntry::constant(format!("e{}", i), "one two three four");
            e.priority = 100 - i;
            book.push(e);
        }
        let mut entries = merged(LorebookSource::Global, book.clone());
        entries.extend(merged(LorebookSource::Character, book));

        for strategy in [InsertionStrategy::Evenly, InsertionStrategy::CharacterFirst, InsertionStrategy::GlobalFirst] {
            for cap in [1u32, 4, 9, 17, 30] {
                let settings = WorldInfoSettings {
                    context: 0,
                    budget_cap: cap,
                    insertion_strategy: strategy,
                    alert_on_overflow: true,
                    ..Default::default()
                };
                let outcome = scan_lorebooks(&entries, &[], &settings, 0, "m", &WordCounter).await.unwrap();
                let sum: u32 = outcome.entries.iter().map(|e| e.tokens).sum();
                assert!(sum <= cap);
                assert_eq!(sum, outcome.total_tokens);
                assert!(outcome.overflow_alert);
                assert_eq!(outcome.entries.len() + outcome.dropped.len(), 12);
            }
        }
    }

    #[tokio::test]
    async fn overflow_alert_requires_setting() {
        let entries = merged(
            LorebookSource::Global,
            vec![LorebookEntry::constant("big", "a b c d e f g h")],
        );
        let settings = WorldInfoSettings {
            context: 0,
            budget_cap: 3,
            ..Default::default()
        };
        let outcome = scan_lorebooks(&entries, &[], &settings, 0, "m", &WordCounter).await.unwrap();
        assert!(outcome.entries.is_empty());
        assert_eq!(outcome.dropped, vec!["Global / big"]);
        assert!(!outcome.overflow_alert);
    }

    #[test]
    fn formatting_wraps_each_entry() {
        let entries = merged(
            LorebookSource::Global,
            vec![LorebookEntry::constant("a", " first "), LorebookEntry::constant("b", "")],
        );
        let activated: Vec<ActivatedEntry> = entries
            .iter()
            .enumerate()
            .map(|(i, m)| ActivatedEntry::from_merged(m, i))
            .collect();
        assert_eq!(format_lorebook_for_prompt(&activated, "[{0}]"), "[first]");
    }
}
