//! Repository-aware code change assistant
//!
//! Indexes a repository, plans a change with a tool-using agent, applies it,
//! generates and runs tests in a sandbox copy, and commits on request. The
//! [`server`] module exposes the pipeline over HTTP.

pub mod config;
pub mod deepseek;
pub mod diff;
pub mod executor;
pub mod ingest;
pub mod json_repair;
pub mod knowledge;
pub mod llm;
pub mod orchestrator;
pub mod planning;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod trace;
pub mod vcs;

#[cfg(test)]
mod test_support;

// Re-export commonly used items
pub use config::Config;
pub use deepseek::DeepSeekClient;
pub use orchestrator::{AgentSystem, PipelineResults};
