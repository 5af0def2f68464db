use thiserror::Error;

/// Fatal configuration problems. Raised while loading or validating presets,
/// prompt orders and extension prompts; never repaired silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("system prompt '{0}' is missing from the preset")]
    MissingSystemPrompt(String),

    #[error("prompt '{0}' is defined more than once")]
    DuplicatePrompt(String),

    #[error("marker prompt '{0}' must not carry a role or content")]
    MarkerWithContent(String),

    #[error("prompt '{0}' is not a marker and needs both a role and content")]
    MissingContent(String),

    #[error("prompt '{0}' is a system prompt and cannot use an absolute injection depth")]
    IllegalAbsoluteDepth(String),

    #[error("extension prompt '{0}' is registered more than once")]
    DuplicateExtensionPrompt(String),

    #[error("prompt order lists '{0}' more than once")]
    DuplicateOrderEntry(String),

    #[error("prompt order references unknown prompt '{0}'")]
    UnknownOrderEntry(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Error)]
pub enum TokenCountError {
    #[error("failed to load tokenizer: {0}")]
    Load(String),

    #[error("tokenization failed: {0}")]
    Encode(String),

    #[error("no tokenizer available for model '{0}'")]
    UnknownModel(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TokenCount(#[from] TokenCountError),

    #[error("prompt needs {required} tokens before chat history but only {available} are available")]
    ContextBudgetExceeded { required: u32, available: u32 },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<String> for EngineError {
    fn from(value: String) -> Self {
        EngineError::Other(value)
    }
}

impl From<&str> for EngineError {
    fn from(value: &str) -> Self {
        EngineError::Other(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
