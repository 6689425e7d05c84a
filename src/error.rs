use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("{entity} #{id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Match #{id} is already {status}; only pending matches can be decided")]
    InvalidTransition { id: i64, status: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("AI matching failed: {message}")]
    Engine { message: String },

    #[error("Failed to parse AI result: {message}")]
    EngineOutput { message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl MarketError {
    pub fn invalid(message: impl Into<String>) -> Self {
        MarketError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        MarketError::Engine {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;
