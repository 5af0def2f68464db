//! Context engine for roleplay chats: branching message trees, group speaker
//! activation, lorebook scanning, macro substitution and prompt assembly.

pub mod abort_manager;
pub mod chat_manager;
pub mod error;
pub mod group_chat_manager;
pub mod logger;
pub mod message_tree;
pub mod settings;
pub mod tokenizer;
pub mod utils;

pub use abort_manager::{BuildStart, BuildTicket, InputVersions, PromptBuildCoordinator};
pub use chat_manager::dialogue_examples::{parse_dialogue_examples, parse_dialogue_examples_as_messages};
pub use chat_manager::lorebook::{LinkedLorebooks, Lorebook, LorebookEntry};
pub use chat_manager::lorebook_matcher::{scan_lorebooks, LorebookOutcome, LorebookScanner};
pub use chat_manager::macros::{evaluate_macros, MacroContext, MacroEngine};
pub use chat_manager::prompt_engine::{build_prompt, BuildArgs, PromptCollection, PromptMessage};
pub use chat_manager::prompts::{ExtensionPrompt, ExtensionPrompts, Prompt, PromptPreset};
pub use chat_manager::types::{
    Character, Chat, GenerateType, Group, GroupContext, Message, MessageId, Model, Persona, Role,
};
pub use chat_manager::variables::{VarValue, VariableStore};
pub use error::{ConfigError, EngineError, Result, TokenCountError};
pub use group_chat_manager::{ActivationEngine, ChatTarget};
pub use message_tree::{Direction, MessageTree};
pub use settings::{load_settings, EngineSettings, WorldInfoSettings};
pub use tokenizer::{CachedTokenCounter, EstimateTokenCounter, HfTokenCounter, TokenCache, TokenCounter};
