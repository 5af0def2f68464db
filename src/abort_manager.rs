//! Build coordination.
//!
//! Prompt builds are re-triggered whenever an input changes, so several can be
//! in flight for one chat. Each build takes a ticket carrying a generation
//! number; starting a newer build signals the older one to stop, and only the
//! result of the newest generation is kept.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::chat_manager::prompt_engine::{build_prompt, BuildArgs, PromptCollection};
use crate::error::Result;
use crate::tokenizer::TokenCounter;

#[derive(Debug)]
pub struct AbortHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl AbortHandle {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn abort(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Input versions
// ============================================================================

/// Content hashes of every build input, by input name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputVersions {
    versions: BTreeMap<String, String>,
}

impl InputVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track<T: Serialize + ?Sized>(mut self, input: &str, value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        self.versions
            .insert(input.to_string(), blake3::hash(&bytes).to_hex().to_string());
        Ok(self)
    }

    pub fn get(&self, input: &str) -> Option<&str> {
        self.versions.get(input).map(String::as_str)
    }

    /// Names of inputs whose version differs between the two sets.
    pub fn changed<'a>(&'a self, other: &'a InputVersions) -> Vec<&'a str> {
        let names: BTreeSet<&str> = self
            .versions
            .keys()
            .chain(other.versions.keys())
            .map(String::as_str)
            .filter(|name| self.get(name) != other.get(name))
            .collect();
        names.into_iter().collect()
    }

    /// Versions of everything a prompt build reads. The clock is left out so
    /// time alone never triggers a rebuild.
    pub fn from_args(args: &BuildArgs) -> Result<Self> {
        let extension_prompts: Vec<_> = args.extension_prompts.iter().collect();
        Self::new()
            .track("generateType", &args.generate_type)?
            .track("branch", args.branch)?
            .track("chat", args.chat)?
            .track("settings", args.settings)?
            .track("preset", args.preset)?
            .track("model", &args.model)?
            .track("persona", &args.persona)?
            .track("character", &args.character)?
            .track("group", &args.group.map(|g| (&g.group, &g.members)))?
            .track("lorebooks", args.lorebooks)?
            .track("extensionPrompts", &extension_prompts)?
            .track("variables", &(args.variables, args.global_variables))?
            .track("quietPrompt", &args.quiet_prompt)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug)]
pub struct BuildTicket {
    chat_id: String,
    generation: u64,
    versions: InputVersions,
    cancelled: oneshot::Receiver<()>,
}

impl BuildTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
pub enum BuildStart {
    /// Inputs match the last applied build.
    Reuse(PromptCollection),
    Started(BuildTicket),
}

#[derive(Debug, Default)]
struct ChatBuildState {
    generation: u64,
    in_flight: Option<AbortHandle>,
    latest: Option<(InputVersions, PromptCollection)>,
}

#[derive(Clone, Default)]
pub struct PromptBuildCoordinator {
    inner: Arc<Mutex<HashMap<String, ChatBuildState>>>,
}

impl PromptBuildCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, chat_id: &str, versions: InputVersions) -> BuildStart {
        let (tx, rx) = oneshot::channel();
        let mut ticket = BuildTicket {
            chat_id: chat_id.to_string(),
            generation: 0,
            versions,
            cancelled: rx,
        };

        if let Ok(mut map) = self.inner.lock() {
            let state = map.entry(chat_id.to_string()).or_default();
            if let Some((latest_versions, collection)) = &state.latest {
                if state.in_flight.is_none() && *latest_versions == ticket.versions {
                    tracing::debug!(target: "prompt_engine", chat_id, "inputs unchanged, reusing prompt");
                    return BuildStart::Reuse(collection.clone());
                }
                tracing::debug!(
                    target: "prompt_engine",
                    chat_id,
                    changed = ?latest_versions.changed(&ticket.versions),
                    "prompt inputs changed"
                );
            }
            if let Some(mut previous) = state.in_flight.take() {
                previous.abort();
            }
            state.generation += 1;
            state.in_flight = Some(AbortHandle::new(tx));
            ticket.generation = state.generation;
        }
        BuildStart::Started(ticket)
    }

    /// Applies a finished build if it is still the newest for its chat.
    /// Stale results are dropped and `None` is returned.
    pub fn complete(&self, ticket: BuildTicket, collection: PromptCollection) -> Option<PromptCollection> {
        let Ok(mut map) = self.inner.lock() else {
            return None;
        };
        let state = map.get_mut(&ticket.chat_id)?;
        if state.generation != ticket.generation {
            tracing::warn!(
                target: "prompt_engine",
                chat_id = %ticket.chat_id,
                generation = ticket.generation,
                current = state.generation,
                "stale prompt build discarded"
            );
            return None;
        }
        state.in_flight = None;
        state.latest = Some((ticket.versions, collection.clone()));
        Some(collection)
    }

    /// Forgets an in-flight build that failed.
    pub fn release(&self, ticket: &BuildTicket) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(state) = map.get_mut(&ticket.chat_id) {
                if state.generation == ticket.generation {
                    state.in_flight = None;
                }
            }
        }
    }

    pub fn is_current(&self, ticket: &BuildTicket) -> bool {
        if let Ok(map) = self.inner.lock() {
            map.get(&ticket.chat_id)
                .map_or(false, |state| state.generation == ticket.generation)
        } else {
            false
        }
    }

    pub fn latest(&self, chat_id: &str) -> Option<PromptCollection> {
        let map = self.inner.lock().ok()?;
        map.get(chat_id)?.latest.as_ref().map(|(_, c)| c.clone())
    }

    /// Drops all state for a chat, cancelling any build in flight.
    pub fn invalidate(&self, chat_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(mut state) = map.remove(chat_id) {
                if let Some(handle) = state.in_flight.as_mut() {
                    handle.abort();
                }
            }
        }
    }

    /// Builds the prompt unless the inputs match the last applied build.
    /// Returns `None` when a newer build superseded this one.
    pub async fn build(
        &self,
        args: &BuildArgs<'_>,
        counter: &dyn TokenCounter,
    ) -> Result<Option<PromptCollection>> {
        let versions = InputVersions::from_args(args)?;
        let mut ticket = match self.begin(&args.chat.id, versions) {
            BuildStart::Reuse(collection) => return Ok(Some(collection)),
            BuildStart::Started(ticket) => ticket,
        };

        let outcome = tokio::select! {
            result = build_prompt(args, counter) => result,
            _ = &mut ticket.cancelled => {
                tracing::debug!(
                    target: "prompt_engine",
                    chat_id = %ticket.chat_id,
                    generation = ticket.generation,
                    "prompt build superseded"
                );
                return Ok(None);
            }
        };

        match outcome {
            Ok(collection) => Ok(self.complete(ticket, collection)),
            Err(e) => {
                self.release(&ticket);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_manager::lorebook::LinkedLorebooks;
    use crate::chat_manager::prompts::{ExtensionPrompts, PromptPreset};
    use crate::chat_manager::types::{Character, Chat, GenerateType, Message, Model, Persona, Role};
    use crate::chat_manager::variables::VariableStore;
    use crate::settings::EngineSettings;
    use crate::error::{EngineError, TokenCountError};
    use crate::tokenizer::{EstimateTokenCounter, TokenCounter};

    struct Inputs {
        messages: Vec<Message>,
        chat: Chat,
        settings: EngineSettings,
        preset: PromptPreset,
        model: Model,
        persona: Persona,
        character: Character,
        lorebooks: LinkedLorebooks,
        extensions: ExtensionPrompts,
        variables: VariableStore,
    }

    fn inputs() -> Inputs {
        Inputs {
            messages: vec![Message::text(Role::User, "01", "hello")],
            chat: Chat {
                id: "chat".into(),
                summary: None,
            },
            settings: EngineSettings::default(),
            preset: PromptPreset::default(),
            model: Model {
                id: "m".into(),
                display_name: "M".into(),
                context_length: 4096,
                max_output_tokens: 256,
            },
            persona: Persona {
                id: "p".into(),
                name: "Bob".into(),
                description: String::new(),
            },
            character: Character {
                id: "a".into(),
                name: "Alice".into(),
                ..Default::default()
            },
            lorebooks: LinkedLorebooks::default(),
            extensions: ExtensionPrompts::default(),
            variables: VariableStore::new(),
        }
    }

    fn args<'a>(inputs: &'a Inputs, branch: &'a [&'a Message]) -> BuildArgs<'a> {
        BuildArgs {
            generate_type: GenerateType::Normal,
            branch,
            chat: &inputs.chat,
            settings: &inputs.settings,
            preset: &inputs.preset,
            model: Some(&inputs.model),
            persona: Some(&inputs.persona),
            character: Some(&inputs.character),
            group: None,
            lorebooks: &inputs.lorebooks,
            extension_prompts: &inputs.extensions,
            variables: &inputs.variables,
            global_variables: &inputs.variables,
            quiet_prompt: None,
            now: None,
        }
    }

    fn versions(tag: &str) -> InputVersions {
        InputVersions::new().track("branch", tag).unwrap()
    }

    #[test]
    fn newer_build_supersedes_older() {
        let coordinator = PromptBuildCoordinator::new();
        let BuildStart::Started(mut first) = coordinator.begin("c", versions("a")) else {
            panic!("expected a fresh build");
        };
        let BuildStart::Started(second) = coordinator.begin("c", versions("b")) else {
            panic!("expected a fresh build");
        };

        assert!(first.cancelled.try_recv().is_ok());
        assert!(!coordinator.is_current(&first));
        assert!(coordinator.is_current(&second));
        assert_eq!(second.generation(), first.generation() + 1);

        assert!(coordinator.complete(first, PromptCollection::default()).is_none());
        assert!(coordinator.latest("c").is_none());
        let applied = PromptCollection {
            total_tokens: 7,
            ..Default::default()
        };
        assert_eq!(coordinator.complete(second, applied.clone()), Some(applied.clone()));
        assert_eq!(coordinator.latest("c"), Some(applied));
    }

    #[test]
    fn unchanged_inputs_reuse_last_result() {
        let coordinator = PromptBuildCoordinator::new();
        let BuildStart::Started(ticket) = coordinator.begin("c", versions("a")) else {
            panic!("expected a fresh build");
        };
        coordinator.complete(ticket, PromptCollection::default());
        assert!(matches!(coordinator.begin("c", versions("a")), BuildStart::Reuse(_)));
        assert!(matches!(coordinator.begin("c", versions("b")), BuildStart::Started(_)));
        assert!(matches!(coordinator.begin("other", versions("a")), BuildStart::Started(_)));
    }

    #[test]
    fn invalidate_cancels_in_flight_build() {
        let coordinator = PromptBuildCoordinator::new();
        let BuildStart::Started(mut ticket) = coordinator.begin("c", versions("a")) else {
            panic!("expected a fresh build");
        };
        coordinator.invalidate("c");
        assert!(ticket.cancelled.try_recv().is_ok());
        assert!(!coordinator.is_current(&ticket));
    }

    #[test]
    fn versions_track_content_changes() {
        let mut data = inputs();
        let branch: Vec<&Message> = data.messages.iter().collect();
        let before = InputVersions::from_args(&args(&data, &branch)).unwrap();
        let again = InputVersions::from_args(&args(&data, &branch)).unwrap();
        assert_eq!(before, again);

        data.character.description = "changed".into();
        let branch: Vec<&Message> = data.messages.iter().collect();
        let after = InputVersions::from_args(&args(&data, &branch)).unwrap();
        assert_eq!(before.changed(&after), vec!["character"]);
    }

    #[tokio::test]
    async fn build_applies_and_then_reuses() {
        let data = inputs();
        let branch: Vec<&Message> = data.messages.iter().collect();
        let coordinator = PromptBuildCoordinator::new();

        let first = coordinator
            .build(&args(&data, &branch), &EstimateTokenCounter)
            .await
            .unwrap()
            .unwrap();
        assert!(!first.is_empty());
        let second = coordinator
            .build(&args(&data, &branch), &EstimateTokenCounter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(coordinator.latest("chat"), Some(first));
    }

    struct BrokenCounter;

    #[async_trait::async_trait]
    impl TokenCounter for BrokenCounter {
        async fn count_tokens(&self, _text: &str, _model_id: &str) -> std::result::Result<u32, TokenCountError> {
            Err(TokenCountError::Encode("tokenizer crashed".into()))
        }
    }

    #[tokio::test]
    async fn failed_build_reports_error_and_releases_chat() {
        let mut data = inputs();
        let coordinator = PromptBuildCoordinator::new();

        let branch: Vec<&Message> = data.messages.iter().collect();
        let applied = coordinator
            .build(&args(&data, &branch), &EstimateTokenCounter)
            .await
            .unwrap()
            .unwrap();

        data.messages.push(Message::text(Role::Assistant, "02", "hi").with_parent("01"));
        let longer: Vec<&Message> = data.messages.iter().collect();
        let err = coordinator
            .build(&args(&data, &longer), &BrokenCounter)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TokenCount(TokenCountError::Encode(_))));

        // Nothing is left in flight, so the original inputs reuse the applied prompt.
        data.messages.pop();
        let branch: Vec<&Message> = data.messages.iter().collect();
        let reused = coordinator
            .build(&args(&data, &branch), &BrokenCounter)
            .await
            .unwrap();
        assert_eq!(reused, Some(applied));
    }
}
