//! LLM integration for sciforge.
//!
//! The generative backend talks to a model through the [`LlmProvider`]
//! trait. [`LiteLlmClient`] implements it for any OpenAI-compatible endpoint;
//! tests substitute their own providers.
//!
//! ```ignore
//! use sciforge::llm::{LiteLlmClient, LlmProvider, GenerationRequest, Message};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("Hello")]);
//! let response = client.generate(request).await?;
//! ```

pub mod client;

pub use client::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL,
};
