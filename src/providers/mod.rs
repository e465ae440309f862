//! Provider adapter implementations.

pub mod mock;
pub use mock::{MockProvider, MockReply};

pub mod lmstudio;
pub use lmstudio::LMStudioProvider;

// Cloud adapter for OpenRouter, OpenAI and other OpenAI-compatible APIs
pub mod openai_compatible;
pub use openai_compatible::OpenAICompatibleProvider;
