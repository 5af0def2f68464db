//! Prompt assembly.
//!
//! Resolves the preset's prompt order, fills marker slots, splices in-chat
//! injections into the history and fits the result to the model's context.
//! Macro evaluation and lorebook activation are synchronous; counting tokens
//! is the only await.

use blake3::Hasher;
use chrono::{DateTime, FixedOffset};
use futures::future::try_join_all;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use super::dialogue_examples::{parse_dialogue_examples, parse_dialogue_examples_as_messages};
use super::lorebook::LinkedLorebooks;
use super::lorebook_matcher::{
    format_lorebook_for_prompt, ActivatedEntry, LorebookOutcome, LorebookScanner, ResolvedPosition,
    ScanMessage,
};
use super::macros::{substitute_names, MacroContext, MacroEngine};
use super::prompts::{
    apply_format, ExtensionPosition, ExtensionPrompt, ExtensionPrompts, PromptPreset, ResolvedPrompt,
    SystemPromptId,
};
use super::types::{Character, Chat, GenerateType, GroupContext, Message, Model, Persona, Role};
use super::variables::VariableStore;
use crate::error::{EngineError, Result};
use crate::settings::EngineSettings;
use crate::tokenizer::TokenCounter;

/// Extension prompt name used for the chat summary.
pub const SUMMARY_PROMPT: &str = "summary";

const SOURCE_HISTORY: &str = "chatHistory";
const SOURCE_EXAMPLES: &str = "dialogueExamples";
const SOURCE_NEW_CHAT: &str = "newChat";
const SOURCE_NEW_EXAMPLE_CHAT: &str = "newExampleChat";
const SOURCE_GROUP_NUDGE: &str = "groupNudge";
const SOURCE_CONTINUE_NUDGE: &str = "continueNudge";
const SOURCE_IMPERSONATE: &str = "impersonate";
const SOURCE_QUIET: &str = "quietPrompt";
const SOURCE_LORE_DEPTH: &str = "worldInfoDepth";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Slot that produced the message: a prompt identifier, `chatHistory`,
    /// `extension:<name>`, ...
    pub source: String,
    pub tokens: u32,
}

impl PromptMessage {
    fn new(role: Role, content: impl Into<String>, source: &str) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            source: source.to_string(),
            tokens: 0,
        }
    }
}

/// Result of one build. An empty collection means the chat is not ready to
/// generate (no model, persona or character).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCollection {
    pub messages: Vec<PromptMessage>,
    pub total_tokens: u32,
    /// blake3 over every message's role and content.
    pub fingerprint: String,
    pub activated_lore: Vec<String>,
    pub lorebook_overflow: bool,
    pub trimmed_history: usize,
    /// Variable stores after macro evaluation; callers persist them.
    #[serde(skip)]
    pub variables: VariableStore,
    #[serde(skip)]
    pub global_variables: VariableStore,
}

impl PromptCollection {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn not_ready(args: &BuildArgs) -> Self {
        Self {
            variables: args.variables.clone(),
            global_variables: args.global_variables.clone(),
            ..Self::default()
        }
    }
}

/// Read-only snapshot of everything one build looks at.
#[derive(Debug, Clone, Copy)]
pub struct BuildArgs<'a> {
    pub generate_type: GenerateType,
    pub branch: &'a [&'a Message],
    pub chat: &'a Chat,
    pub settings: &'a EngineSettings,
    pub preset: &'a PromptPreset,
    pub model: Option<&'a Model>,
    pub persona: Option<&'a Persona>,
    /// The character answering this turn.
    pub character: Option<&'a Character>,
    pub group: Option<&'a GroupContext>,
    pub lorebooks: &'a LinkedLorebooks,
    pub extension_prompts: &'a ExtensionPrompts,
    pub variables: &'a VariableStore,
    pub global_variables: &'a VariableStore,
    /// Appended as a system message for quiet generations.
    pub quiet_prompt: Option<&'a str>,
    /// Clock for time macros; `None` reads the local clock.
    pub now: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Fixed,
    History,
}

#[derive(Debug, Clone)]
struct Slot {
    kind: SlotKind,
    message: PromptMessage,
}

impl Slot {
    fn fixed(message: PromptMessage) -> Self {
        Self {
            kind: SlotKind::Fixed,
            message,
        }
    }

    fn history(message: PromptMessage) -> Self {
        Self {
            kind: SlotKind::History,
            message,
        }
    }
}

#[derive(Debug, Clone)]
struct Injection {
    depth: u32,
    role: Role,
    content: String,
    source: String,
}

/// Macro-evaluated text for every slot of one build.
#[derive(Debug, Default)]
struct Rendered {
    /// Prompt identifier to content, for authored prompts and the
    /// character/persona field markers.
    prompts: HashMap<String, String>,
    examples: Vec<PromptMessage>,
    extensions: Vec<ExtensionPrompt>,
    separator: Option<PromptMessage>,
    nudges: Vec<PromptMessage>,
}

// ============================================================================
// Build
// ============================================================================

pub async fn build_prompt(args: &BuildArgs<'_>, counter: &dyn TokenCounter) -> Result<PromptCollection> {
    let (Some(model), Some(persona), Some(character)) = (args.model, args.persona, args.character) else {
        tracing::debug!(
            target: "prompt_engine",
            chat_id = %args.chat.id,
            has_model = args.model.is_some(),
            has_persona = args.persona.is_some(),
            has_character = args.character.is_some(),
            "prompt not ready"
        );
        return Ok(PromptCollection::not_ready(args));
    };

    let order = args.preset.resolve_order()?;
    let mut variables = args.variables.clone();
    let mut global_variables = args.global_variables.clone();
    let ctx = MacroContext {
        user: &persona.name,
        persona_description: &persona.description,
        character: Some(character),
        group: args.group,
        model: Some(model.id.as_str()),
        max_prompt: model.available_context(),
        summary: args.chat.summary.as_deref().unwrap_or(""),
        history: args.branch,
        chat_id: &args.chat.id,
        now: args.now,
    };

    let merged = args.lorebooks.merge();
    let scanner = LorebookScanner::new(&merged, &args.settings.world_info);
    let scan_texts: Vec<(String, String)> = args
        .branch
        .iter()
        .map(|m| (speaker_name(m, args.group, character, persona), m.text_content()))
        .collect();
    let scan_history: Vec<ScanMessage> = scan_texts
        .iter()
        .map(|(speaker, text)| ScanMessage { speaker, text })
        .collect();
    let scanned = scanner.scan(&scan_history);

    let (rendered, occurrence) = {
        let mut engine = MacroEngine::new(&ctx, &mut variables, &mut global_variables);
        let rendered = render_slots(args, character, persona, &order, &mut engine)?;
        (rendered, engine.occurrence())
    };

    // Entry macros are previewed on scratch stores so the budget sees the
    // rendered text; only entries that survive it touch the real variables.
    let raw_lore: Vec<String> = scanned.entries.iter().map(|e| e.content.clone()).collect();
    let candidates: Vec<ActivatedEntry> = {
        let (mut scratch_locals, mut scratch_globals) = (variables.clone(), global_variables.clone());
        let mut preview = MacroEngine::new(&ctx, &mut scratch_locals, &mut scratch_globals).starting_at(occurrence);
        scanned
            .entries
            .into_iter()
            .map(|mut entry| {
                entry.content = preview.evaluate(&entry.content);
                entry
            })
            .collect()
    };

    let mut budgeted = scanner
        .apply_budget(candidates, model.context_length, &model.id, counter)
        .await?;
    {
        // Survivors are a prefix of the candidates, so this replays the preview.
        let mut engine = MacroEngine::new(&ctx, &mut variables, &mut global_variables).starting_at(occurrence);
        for (entry, raw) in budgeted.entries.iter_mut().zip(&raw_lore) {
            entry.content = engine.evaluate(raw);
        }
    }
    let lore = LorebookOutcome {
        entries: budgeted.entries,
        dropped: budgeted.dropped,
        total_tokens: budgeted.total_tokens,
        overflow_alert: budgeted.overflow_alert,
        recursion_steps: scanned.recursion_steps,
        scan_depth_used: scanned.scan_depth_used,
    };
    tracing::debug!(
        target: "prompt_engine",
        activated = ?lore.labels(),
        dropped = ?lore.dropped,
        lore_tokens = lore.total_tokens,
        "lorebook entries resolved"
    );

    let history = history_messages(args, character, persona);
    let mut slots = assemble(&order, rendered, &lore, history, &args.preset.wi_format);

    let counts = try_join_all(
        slots
            .iter()
            .map(|slot| counter.count_tokens(&slot.message.content, &model.id)),
    )
    .await?;
    for (slot, tokens) in slots.iter_mut().zip(counts) {
        slot.message.tokens = tokens;
    }
    let trimmed_history = trim_history(&mut slots, model.available_context())?;

    let mut messages: Vec<PromptMessage> = slots.into_iter().map(|s| s.message).collect();
    if args.preset.squash_system_messages {
        messages = squash_system_messages(messages, counter, &model.id).await?;
    }

    let total_tokens = messages.iter().map(|m| m.tokens).sum();
    let fingerprint = fingerprint(&messages);
    tracing::info!(
        target: "prompt_engine",
        chat_id = %args.chat.id,
        generate_type = ?args.generate_type,
        entries = messages.len(),
        total_tokens,
        trimmed_history,
        lore_entries = lore.entries.len(),
        fingerprint = %fingerprint,
        "prompt built"
    );

    Ok(PromptCollection {
        messages,
        total_tokens,
        fingerprint,
        activated_lore: lore.labels(),
        lorebook_overflow: lore.overflow_alert,
        trimmed_history,
        variables,
        global_variables,
    })
}

/// Combined hash of the assembled prompt, stable across identical builds.
pub fn fingerprint(messages: &[PromptMessage]) -> String {
    let mut hasher = Hasher::new();
    for message in messages {
        hasher.update(message.role.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(message.content.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

// ============================================================================
// Rendering
// ============================================================================

fn speaker_name(
    message: &Message,
    group: Option<&GroupContext>,
    character: &Character,
    persona: &Persona,
) -> String {
    if let Some(name) = message.name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match message.role {
        Role::User => persona.name.clone(),
        Role::Assistant => group
            .zip(message.character_id.as_deref())
            .and_then(|(g, id)| g.members.iter().find(|c| c.id == id))
            .unwrap_or(character)
            .name
            .clone(),
        Role::System => String::new(),
    }
}

fn formatted_field(engine: &mut MacroEngine, format: &str, value: &str) -> String {
    let value = engine.evaluate(value);
    let format = engine.evaluate(format);
    apply_format(&format, value.trim())
}

/// Evaluates every slot in prompt order so variable side effects happen in
/// the order the model will read them.
fn render_slots(
    args: &BuildArgs,
    character: &Character,
    persona: &Persona,
    order: &[ResolvedPrompt],
    engine: &mut MacroEngine,
) -> Result<Rendered> {
    let preset = args.preset;
    let mut rendered = Rendered::default();

    for resolved in order.iter().filter(|r| r.enabled) {
        let prompt = resolved.prompt;
        let content = match (prompt.marker, prompt.system_id()) {
            (true, Some(SystemPromptId::CharDescription)) => {
                formatted_field(engine, &preset.description_format, &character.description)
            }
            (true, Some(SystemPromptId::CharPersonality)) => {
                formatted_field(engine, &preset.personality_format, &character.personality)
            }
            (true, Some(SystemPromptId::Scenario)) => {
                formatted_field(engine, &preset.scenario_format, &character.scenario)
            }
            (true, Some(SystemPromptId::PersonaDescription)) => {
                formatted_field(engine, &preset.persona_format, &persona.description)
            }
            (true, Some(SystemPromptId::DialogueExamples)) => {
                rendered.examples = render_examples(args, character, persona, engine);
                continue;
            }
            (true, _) => continue,
            (false, _) => match prompt.content.as_deref() {
                Some(content) => engine.evaluate(content),
                None => continue,
            },
        };
        rendered.prompts.insert(prompt.identifier.clone(), content);
    }

    let mut extensions = args.extension_prompts.clone();
    let summary = &args.settings.summary;
    if summary.enabled {
        if let Some(text) = args.chat.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            extensions.insert(ExtensionPrompt {
                name: SUMMARY_PROMPT.to_string(),
                content: apply_format(&summary.template, text),
                position: summary.position,
                depth: summary.depth,
                role: summary.role,
            })?;
        }
    }
    rendered.extensions = extensions
        .iter()
        .map(|p| ExtensionPrompt {
            content: engine.evaluate(&p.content),
            ..p.clone()
        })
        .filter(|p| !p.content.trim().is_empty())
        .collect();

    let separator = if args.group.is_some() {
        &preset.new_group_chat_prompt
    } else {
        &preset.new_chat_prompt
    };
    rendered.separator = Some(engine.evaluate(separator))
        .filter(|s| !s.trim().is_empty())
        .map(|s| PromptMessage::new(Role::System, s, SOURCE_NEW_CHAT));

    let nudge = match args.generate_type {
        GenerateType::Continue if !args.branch.is_empty() => {
            Some((preset.continue_nudge_prompt.as_str(), SOURCE_CONTINUE_NUDGE))
        }
        GenerateType::Continue => None,
        GenerateType::Impersonate => Some((preset.impersonation_prompt.as_str(), SOURCE_IMPERSONATE)),
        GenerateType::Quiet => args.quiet_prompt.map(|q| (q, SOURCE_QUIET)),
        GenerateType::Normal | GenerateType::Regenerate if args.group.is_some() => {
            Some((preset.group_nudge_prompt.as_str(), SOURCE_GROUP_NUDGE))
        }
        GenerateType::Normal | GenerateType::Regenerate => None,
    };
    if let Some((text, source)) = nudge {
        let text = engine.evaluate(text);
        if !text.trim().is_empty() {
            rendered.nudges.push(PromptMessage::new(Role::System, text, source));
        }
    }

    Ok(rendered)
}

fn render_examples(
    args: &BuildArgs,
    character: &Character,
    persona: &Persona,
    engine: &mut MacroEngine,
) -> Vec<PromptMessage> {
    let blocks = parse_dialogue_examples(&engine.evaluate(&character.mes_example));
    if blocks.is_empty() {
        return Vec::new();
    }
    let separator = engine.evaluate(&args.preset.new_example_chat_prompt);
    let turns = parse_dialogue_examples_as_messages(
        &blocks,
        &persona.name,
        &[character.name.as_str()],
        args.group.is_some(),
    );

    let mut out = Vec::new();
    for block in turns.into_iter().filter(|b| !b.is_empty()) {
        if !separator.trim().is_empty() {
            out.push(PromptMessage::new(Role::System, separator.clone(), SOURCE_NEW_EXAMPLE_CHAT));
        }
        out.extend(
            block
                .into_iter()
                .map(|turn| PromptMessage::new(turn.role, turn.content, SOURCE_EXAMPLES)),
        );
    }
    out
}

/// Branch messages as they go to the model. Continue drops the message being
/// continued; regenerate drops the reply being replaced. History only gets
/// name substitution, never full macro evaluation.
fn history_messages(args: &BuildArgs, character: &Character, persona: &Persona) -> Vec<PromptMessage> {
    let mut branch = args.branch;
    match args.generate_type {
        GenerateType::Continue => {
            if let Some((_, rest)) = branch.split_last() {
                branch = rest;
            }
        }
        GenerateType::Regenerate => {
            if let Some((last, rest)) = branch.split_last() {
                if last.role == Role::Assistant {
                    branch = rest;
                }
            }
        }
        _ => {}
    }

    branch
        .iter()
        .filter_map(|message| {
            let text = substitute_names(&message.text_content(), &character.name, &persona.name);
            if text.trim().is_empty() {
                return None;
            }
            let content = match args.group {
                Some(group) if message.role != Role::System => format!(
                    "{}: {}",
                    speaker_name(message, Some(group), character, persona),
                    text
                ),
                _ => text,
            };
            Some(PromptMessage::new(message.role, content, SOURCE_HISTORY))
        })
        .collect()
}

// ============================================================================
// Assembly
// ============================================================================

fn slot_content(
    resolved: &ResolvedPrompt,
    rendered: &Rendered,
    lore: &LorebookOutcome,
    wi_format: &str,
) -> Option<String> {
    let content = match resolved.prompt.system_id() {
        Some(SystemPromptId::WorldInfoBefore) => format_lorebook_for_prompt(
            lore.entries.iter().filter(|e| e.position == ResolvedPosition::BeforeMain),
            wi_format,
        ),
        Some(SystemPromptId::WorldInfoAfter) => format_lorebook_for_prompt(
            lore.entries.iter().filter(|e| e.position == ResolvedPosition::AfterMain),
            wi_format,
        ),
        _ => rendered.prompts.get(&resolved.prompt.identifier)?.clone(),
    };
    (!content.trim().is_empty()).then_some(content)
}

fn collect_injections(
    order: &[ResolvedPrompt],
    rendered: &Rendered,
    lore: &LorebookOutcome,
    wi_format: &str,
) -> Vec<Injection> {
    let mut injections = Vec::new();

    for resolved in order.iter().filter(|r| r.enabled && r.prompt.is_absolute()) {
        if let Some(content) = slot_content(resolved, rendered, lore, wi_format) {
            injections.push(Injection {
                depth: resolved.prompt.injection_depth,
                role: resolved.prompt.role.unwrap_or(Role::System),
                content,
                source: resolved.prompt.identifier.clone(),
            });
        }
    }

    for entry in &lore.entries {
        if let ResolvedPosition::AtDepth { depth, role } = entry.position {
            let content = format_lorebook_for_prompt([entry], wi_format);
            if !content.is_empty() {
                injections.push(Injection {
                    depth,
                    role,
                    content,
                    source: SOURCE_LORE_DEPTH.to_string(),
                });
            }
        }
    }

    for ext in rendered.extensions.iter().filter(|p| p.position == ExtensionPosition::InChat) {
        injections.push(Injection {
            depth: ext.depth,
            role: ext.role,
            content: ext.content.clone(),
            source: format!("extension:{}", ext.name),
        });
    }
    injections
}

/// Places injections into the history, `depth` messages from the end. Depths
/// past the start clamp to the top. Injections sharing a depth and role are
/// joined; at one spot, deeper groups come first, then system, user,
/// assistant.
fn splice_injections(history: Vec<PromptMessage>, injections: Vec<Injection>) -> Vec<Slot> {
    let len = history.len();
    let mut grouped: BTreeMap<(usize, Reverse<u32>, Role), (String, Vec<String>)> = BTreeMap::new();
    for injection in injections {
        let at = len - (injection.depth as usize).min(len);
        grouped
            .entry((at, Reverse(injection.depth), injection.role))
            .or_insert_with(|| (injection.source.clone(), Vec::new()))
            .1
            .push(injection.content);
    }

    let injected = |((_, _, role), (source, contents)): ((usize, Reverse<u32>, Role), (String, Vec<String>))| {
        Slot::fixed(PromptMessage::new(role, contents.join("\n"), &source))
    };

    let mut out = Vec::with_capacity(len + grouped.len());
    let mut pending = grouped.into_iter().peekable();
    for (index, message) in history.into_iter().enumerate() {
        while pending.peek().map_or(false, |((at, _, _), _)| *at == index) {
            if let Some(group) = pending.next() {
                out.push(injected(group));
            }
        }
        out.push(Slot::history(message));
    }
    out.extend(pending.map(injected));
    out
}

fn extension_slots(extensions: &[ExtensionPrompt], position: ExtensionPosition) -> Vec<Slot> {
    extensions
        .iter()
        .filter(|p| p.position == position)
        .map(|p| Slot::fixed(PromptMessage::new(p.role, p.content.clone(), &format!("extension:{}", p.name))))
        .collect()
}

fn assemble(
    order: &[ResolvedPrompt],
    mut rendered: Rendered,
    lore: &LorebookOutcome,
    history: Vec<PromptMessage>,
    wi_format: &str,
) -> Vec<Slot> {
    let injections = collect_injections(order, &rendered, lore, wi_format);
    let mut history = Some(splice_injections(history, injections));
    let mut nudges: Vec<Slot> = std::mem::take(&mut rendered.nudges).into_iter().map(Slot::fixed).collect();
    let mut main_placed = false;
    let mut slots = Vec::new();

    for resolved in order.iter().filter(|r| r.enabled && !r.prompt.is_absolute()) {
        match resolved.prompt.system_id() {
            Some(SystemPromptId::ChatHistory) => {
                if let Some(separator) = rendered.separator.take() {
                    slots.push(Slot::fixed(separator));
                }
                slots.extend(history.take().unwrap_or_default());
                slots.append(&mut nudges);
            }
            Some(SystemPromptId::DialogueExamples) => {
                slots.extend(std::mem::take(&mut rendered.examples).into_iter().map(Slot::fixed));
            }
            Some(SystemPromptId::Main) => {
                slots.extend(extension_slots(&rendered.extensions, ExtensionPosition::BeforeMain));
                if let Some(content) = slot_content(resolved, &rendered, lore, wi_format) {
                    let role = resolved.prompt.role.unwrap_or(Role::System);
                    slots.push(Slot::fixed(PromptMessage::new(role, content, SystemPromptId::Main.as_str())));
                }
                slots.extend(extension_slots(&rendered.extensions, ExtensionPosition::AfterMain));
                main_placed = true;
            }
            _ => {
                if let Some(content) = slot_content(resolved, &rendered, lore, wi_format) {
                    let role = resolved.prompt.role.unwrap_or(Role::System);
                    slots.push(Slot::fixed(PromptMessage::new(role, content, &resolved.prompt.identifier)));
                }
            }
        }
    }

    if !main_placed {
        let mut head = extension_slots(&rendered.extensions, ExtensionPosition::BeforeMain);
        head.extend(extension_slots(&rendered.extensions, ExtensionPosition::AfterMain));
        slots.splice(0..0, head);
    }
    if history.is_some() {
        tracing::debug!(target: "prompt_engine", "chat history slot disabled, history and injections omitted");
    }
    slots.append(&mut nudges);
    slots
}

// ============================================================================
// Budget
// ============================================================================

/// Drops the oldest history turns until everything fits. Returns how many
/// were dropped; fails when the fixed slots alone do not fit.
fn trim_history(slots: &mut Vec<Slot>, available: u32) -> Result<usize> {
    let fixed: u32 = slots
        .iter()
        .filter(|s| s.kind == SlotKind::Fixed)
        .map(|s| s.message.tokens)
        .sum();
    if fixed > available {
        tracing::warn!(target: "prompt_engine", fixed, available, "fixed prompt exceeds context");
        return Err(EngineError::ContextBudgetExceeded {
            required: fixed,
            available,
        });
    }

    let mut remaining = available - fixed;
    let mut keep = vec![true; slots.len()];
    let mut cut = false;
    for (index, slot) in slots.iter().enumerate().rev() {
        if slot.kind != SlotKind::History {
            continue;
        }
        if !cut && slot.message.tokens <= remaining {
            remaining -= slot.message.tokens;
        } else {
            cut = true;
            keep[index] = false;
        }
    }

    let trimmed = keep.iter().filter(|k| !**k).count();
    if trimmed > 0 {
        tracing::info!(target: "prompt_engine", trimmed, available, "trimmed oldest chat history");
    }
    let mut flags = keep.into_iter();
    slots.retain(|_| flags.next().unwrap_or(true));
    Ok(trimmed)
}

fn squashable(message: &PromptMessage) -> bool {
    message.role == Role::System
        && message.name.is_none()
        && !matches!(
            message.source.as_str(),
            SOURCE_NEW_CHAT | SOURCE_NEW_EXAMPLE_CHAT | SOURCE_GROUP_NUDGE
        )
}

/// Merges runs of unnamed system messages into one and recounts the merged
/// message.
async fn squash_system_messages(
    messages: Vec<PromptMessage>,
    counter: &dyn TokenCounter,
    model_id: &str,
) -> Result<Vec<PromptMessage>> {
    let mut out: Vec<PromptMessage> = Vec::with_capacity(messages.len());
    let mut dirty: Vec<bool> = Vec::with_capacity(messages.len());

    for message in messages {
        if let (Some(prev), Some(prev_dirty)) = (out.last_mut(), dirty.last_mut()) {
            if squashable(prev) && squashable(&message) {
                prev.content = format!("{}\n\n{}", prev.content.trim(), message.content.trim());
                *prev_dirty = true;
                continue;
            }
        }
        out.push(message);
        dirty.push(false);
    }

    for (message, dirty) in out.iter_mut().zip(dirty) {
        if dirty {
            message.tokens = counter.count_tokens(&message.content, model_id).await?;
        }
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
