use thiserror::Error;

#[derive(Error, Debug)]
pub enum WispError {
    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("No provider serves model '{0}'")]
    NoProvider(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("Config error: {0}")]
    Config(String),
}
