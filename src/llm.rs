//! Model abstraction and the tool-calling agent loop
//!
//! Every pipeline stage talks to the model through [`LanguageModel`], so stages can
//! be exercised with scripted models. [`Agent`] wraps a model with a preamble and a
//! set of tools and runs the call/observe loop until the model answers in text or
//! the turn budget runs out.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::deepseek::{Message, Tool};

/// A chat model able to complete prompts and to request tool calls
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Single-turn completion of `prompt`
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// One chat turn; the returned message may carry tool calls
    async fn chat(&self, messages: Vec<Message>, tools: &[Tool]) -> Result<Message>;
}

/// A local function the agent can offer to the model
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Definition sent to the model
    fn definition(&self) -> Tool;

    /// Execute with the raw JSON arguments produced by the model
    async fn call(&self, arguments: &str) -> Result<String>;
}

/// Agent wrapper holding a preamble, tools and the running conversation
pub struct Agent {
    model: Arc<dyn LanguageModel>,
    preamble: Option<String>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    max_turns: usize,
    messages: Vec<Message>,
}

impl Agent {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            preamble: None,
            tools: HashMap::new(),
            max_turns: 10,
            messages: Vec::new(),
        }
    }

    /// Set the system prompt (preamble)
    pub fn preamble(mut self, prompt: &str) -> Self {
        self.preamble = Some(prompt.to_string());
        self
    }

    pub fn tool(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        let name = handler.definition().function.name;
        self.tools.insert(name, handler);
        self
    }

    /// Upper bound on model turns for a single prompt
    pub fn max_turns(mut self, turns: usize) -> Self {
        self.max_turns = turns.max(1);
        self
    }

    /// Send a prompt, resolving tool calls until the model answers in text
    pub async fn prompt(&mut self, user_message: &str) -> Result<String> {
        let definitions: Vec<Tool> = {
            let mut names: Vec<&String> = self.tools.keys().collect();
            names.sort();
            names
                .into_iter()
                .map(|name| self.tools[name].definition())
                .collect()
        };

        self.messages.push(Message::user(user_message));

        for turn in 1..=self.max_turns {
            let mut request = Vec::with_capacity(self.messages.len() + 1);
            if let Some(preamble) = &self.preamble {
                request.push(Message::system(preamble.clone()));
            }
            request.extend(self.messages.iter().cloned());

            let reply = self.model.chat(request, &definitions).await?;
            self.messages.push(reply.clone());

            if !reply.has_tool_calls() {
                debug!("Agent answered after {} turn(s)", turn);
                return Ok(reply.content.unwrap_or_default());
            }
            let calls = reply.tool_calls.unwrap_or_default();

            for call in calls {
                info!("🔧 Agent tool call: {}({})", call.function.name, call.function.arguments);
                let output = match self.tools.get(&call.function.name) {
                    Some(handler) => match handler.call(&call.function.arguments).await {
                        Ok(output) => output,
                        Err(e) => {
                            warn!("Tool {} failed: {}", call.function.name, e);
                            format!("Tool error: {e}")
                        }
                    },
                    None => format!("Unknown tool: {}", call.function.name),
                };
                self.messages.push(Message::tool_result(call.id, output));
            }
        }

        Err(anyhow!(
            "Agent stopped after reaching the maximum of {} iterations without a final answer",
            self.max_turns
        ))
    }
}

/// Strip markdown code fences from a model reply that should be raw file content
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.contains("```") {
        return trimmed.to_string();
    }

    // Prefer the body of the first fenced block when the reply wraps it in prose.
    let mut in_block = false;
    let mut body = Vec::new();
    for line in trimmed.lines() {
        if line.trim_start().starts_with("```") {
            if in_block {
                return body.join("\n").trim().to_string();
            }
            in_block = true;
            continue;
        }
        if in_block {
            body.push(line);
        }
    }

    // Unterminated fence: drop the markers and keep everything else.
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
