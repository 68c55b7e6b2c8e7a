//! Fakes shared by the unit tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::deepseek::{Message, Tool};
use crate::ingest::CodeChunk;
use crate::knowledge::{QueryEngine, RetrievedChunk, Retriever};
use crate::llm::LanguageModel;

type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A model that replays scripted replies and records what it was asked
#[derive(Default)]
pub struct ScriptedModel {
    completions: Mutex<VecDeque<String>>,
    chats: Mutex<VecDeque<Message>>,
    responder: Option<Responder>,
    prompts: Mutex<Vec<String>>,
    chat_log: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    /// Completions are returned in order
    pub fn new<S: Into<String>>(completions: Vec<S>) -> Self {
        Self {
            completions: Mutex::new(completions.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Chat replies are returned in order
    pub fn with_chat(replies: Vec<Message>) -> Self {
        Self {
            chats: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    pub fn chats(self, replies: Vec<Message>) -> Self {
        *self.chats.lock().unwrap() = replies.into();
        self
    }

    /// Answer completions by inspecting the prompt; scripted completions are
    /// used when the responder returns `None`
    pub fn responding<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn chat_requests(&self) -> Vec<Vec<Message>> {
        self.chat_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(reply) = self.responder.as_ref().and_then(|r| r(prompt)) {
            return Ok(reply);
        }
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model has no completion left"))
    }

    async fn chat(&self, messages: Vec<Message>, _tools: &[Tool]) -> Result<Message> {
        self.chat_log.lock().unwrap().push(messages);
        self.chats
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model has no chat reply left"))
    }
}

/// Returns its chunks in order for every query
#[derive(Default)]
pub struct StaticRetriever {
    chunks: Vec<CodeChunk>,
}

impl StaticRetriever {
    pub fn new(chunks: Vec<CodeChunk>) -> Self {
        Self { chunks }
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<RetrievedChunk>> {
        Ok(self
            .chunks
            .iter()
            .take(limit)
            .map(|chunk| RetrievedChunk {
                score: 1.0,
                chunk: chunk.clone(),
            })
            .collect())
    }
}

pub fn chunk(file_path: &str, content: &str) -> CodeChunk {
    CodeChunk {
        id: format!("{file_path}#0"),
        file_path: file_path.to_string(),
        start_line: 1,
        end_line: content.lines().count().max(1),
        content: content.to_string(),
    }
}

/// Query engine that answers every question with `answer`
pub fn canned_query_engine(answer: &'static str) -> QueryEngine {
    let retriever = Arc::new(StaticRetriever::new(vec![chunk("context.py", "pass")]));
    let model = Arc::new(ScriptedModel::default().responding(move |_| Some(answer.to_string())));
    QueryEngine::new(retriever, model, 3)
}

/// Model that drives one full pipeline run over a repository holding `parser.py`:
/// the plan rewrites `parser.py` to strip its input and pytest code is generated.
pub fn pipeline_model() -> Arc<ScriptedModel> {
    Arc::new(
        ScriptedModel::default()
            .chats(vec![Message::assistant(
                "Modify parser.py so parse_input strips whitespace.",
            )])
            .responding(|prompt| {
                let reply = if prompt.contains("Convert the following implementation plan") {
                    r#"{"files_to_modify": ["parser.py"], "files_to_create": [], "implementation_steps": [{"description": "Strip input", "files": ["parser.py"]}], "potential_risks": [], "tests": ["whitespace"]}"#
                } else if prompt.contains("I need to modify the following file") {
                    "def parse_input(s):\n    return s.strip()"
                } else if prompt.contains("Generate pytest") {
                    "```python\nfrom parser import parse_input\n\ndef test_strip():\n    assert parse_input(' a ') == 'a'\n```"
                } else if prompt.contains("Analyze the following test failure") {
                    r#"{"summary": "test_strip failed", "root_causes": ["whitespace"], "fixes": []}"#
                } else if prompt.contains("Generate a clear and descriptive git commit message") {
                    "Strip parser input\n\n- trim whitespace in parse_input"
                } else {
                    "parser.py defines parse_input"
                };
                Some(reply.to_string())
            }),
    )
}
