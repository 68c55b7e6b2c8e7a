//! DeepSeek API client module
//!
//! This module provides the chat-completions client used for every model call:
//! - Plain completions for templated prompts
//! - Function calling for the planning agent's retrieval tools
//! - Error and usage reporting

pub mod client;
pub mod types;

pub use client::DeepSeekClient;
pub use types::*;
