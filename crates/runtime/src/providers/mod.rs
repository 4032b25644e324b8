//! LLM provider backends.

mod openai;

pub use openai::{OpenAiBackend, OpenAiBackendBuilder};
