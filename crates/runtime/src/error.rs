use thiserror::Error;

use crate::model::ModelError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("tool session lost: {0}")]
    Session(String),

    #[error("turn limit exceeded after {max_turns} turns")]
    TurnLimitExceeded { max_turns: usize },

    #[error(transparent)]
    Mcp(#[from] mcp::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
