use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot open file: {path}; {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid option value: {0}")]
    InvalidOption(String),

    #[error("Error in regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("Error in forest file line {line}: {reason}")]
    Snapshot { line: usize, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Error in data value expression: {0}")]
    Expression(String),

    #[error("Expression cannot be evaluated: {0}")]
    ExpressionEval(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, GroveError>;
