//! Reasoning service integration.
//!
//! The analysis workers talk to an OpenAI-compatible chat completions API
//! through the [`LlmProvider`] trait. [`LiteLlmClient`] is the production
//! implementation; tests plug in scripted providers.
//!
//! ```ignore
//! use repolens::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("Summarize this repository")]);
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL, OPENROUTER_API_BASE,
};
