pub mod dialogue_examples;
pub mod lorebook;
pub mod lorebook_matcher;
pub mod macros;
pub mod prompt_engine;
pub mod prompts;
pub mod types;
pub mod variables;
