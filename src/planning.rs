//! Planning stage: a tool-calling agent explores the index and drafts a plan
//! narrative, which a second completion restructures into a [`Plan`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::deepseek::{DeepSeekClient, Tool};
use crate::json_repair::parse_lenient;
use crate::knowledge::QueryEngine;
use crate::llm::{Agent, LanguageModel, ToolHandler};

const PLANNER_PREAMBLE: &str = "You are a Planning Agent.
Instructions:
- Generate a plan to change the codebase according to the requirement.
- Search the codebase to find relevant files using the search_codebase tool.
- If relevant files exist, analyze the dependencies between them using the analyze_dependencies tool.
- With that information, write a plan that includes:
  1. Files that need to be modified or created (paths relative to the repository root)
  2. Specific changes needed in each file
  3. Implementation steps in order, each naming the files it touches
  4. Potential risks or considerations
  5. Tests that should be added or modified
- Always include every one of these sections.
- Do not deviate from these instructions.";

// ============================================================================
// Plan
// ============================================================================

/// One ordered implementation step and the files it targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub description: String,
    pub files: Vec<String>,
}

const DESCRIPTION_KEYS: [&str; 4] = ["description", "action", "task", "summary"];

impl PlanStep {
    pub fn new(description: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            description: description.into(),
            files,
        }
    }

    pub fn targets(&self, file_path: &str) -> bool {
        let wanted = normalize_path(file_path);
        self.files.iter().any(|f| normalize_path(f) == wanted)
    }

    /// Read a step from whatever the model produced. Strings are taken as the
    /// description, objects without a usable description are kept as JSON text.
    fn from_value(value: Value) -> Self {
        match value {
            Value::String(description) => Self::new(description, Vec::new()),
            Value::Object(map) => {
                let files = map
                    .get("files")
                    .or_else(|| map.get("file"))
                    .cloned()
                    .map(strings)
                    .unwrap_or_default();
                let description = DESCRIPTION_KEYS.iter().find_map(|key| match map.get(*key) {
                    Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                    _ => None,
                });
                match description {
                    Some(description) => Self::new(description, files),
                    None => Self::new(Value::Object(map).to_string(), files),
                }
            }
            other => Self::new(other.to_string(), Vec::new()),
        }
    }
}

impl<'de> Deserialize<'de> for PlanStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

/// Structured implementation plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, deserialize_with = "string_list")]
    pub files_to_modify: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub files_to_create: Vec<String>,
    #[serde(default, deserialize_with = "step_list")]
    pub implementation_steps: Vec<PlanStep>,
    #[serde(default, deserialize_with = "string_list")]
    pub potential_risks: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub tests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_plan: Option<String>,
}

impl Plan {
    /// Plan with empty lists carrying the unparsed narrative
    pub fn fallback(raw_plan: impl Into<String>) -> Self {
        Self {
            raw_plan: Some(raw_plan.into()),
            ..Default::default()
        }
    }

    /// Files to modify followed by files to create
    pub fn all_files(&self) -> impl Iterator<Item = &String> {
        self.files_to_modify.iter().chain(self.files_to_create.iter())
    }

    pub fn steps_for(&self, file_path: &str) -> Vec<&PlanStep> {
        self.implementation_steps
            .iter()
            .filter(|step| step.targets(file_path))
            .collect()
    }

    /// Attach plan files to steps that arrived as plain text by looking for their
    /// paths in the step description.
    pub fn normalize(&mut self) {
        let files: Vec<String> = self.all_files().cloned().collect();
        for step in self.implementation_steps.iter_mut().filter(|s| s.files.is_empty()) {
            step.files = files
                .iter()
                .filter(|f| step.description.contains(f.as_str()))
                .cloned()
                .collect();
        }
    }
}

fn normalize_path(path: &str) -> &str {
    path.trim().trim_start_matches("./")
}

fn list_items(value: Option<Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.into_iter().filter(|v| !v.is_null()).collect(),
        Some(single) => vec![single],
    }
}

fn strings(value: Value) -> Vec<String> {
    list_items(Some(value))
        .into_iter()
        .map(|item| match item {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect()
}

/// Accept a list of anything, keeping strings as-is and rendering other values as JSON
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(strings).unwrap_or_default())
}

/// Steps are read one by one so a single odd entry never rejects the plan
fn step_list<'de, D>(deserializer: D) -> Result<Vec<PlanStep>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(list_items(value).into_iter().map(PlanStep::from_value).collect())
}

// ============================================================================
// Agent tools
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchCodebaseArgs {
    /// What to look for in the codebase
    pub query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzeDependenciesArgs {
    /// File, module or component whose dependencies should be listed
    pub component: String,
}

/// JSON schema of `T` as a bare object schema for function calling
fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schema_for!(T)).unwrap_or_default();
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    schema
}

struct SearchCodebaseTool {
    query_engine: QueryEngine,
}

#[async_trait]
impl ToolHandler for SearchCodebaseTool {
    fn definition(&self) -> Tool {
        DeepSeekClient::create_tool(
            "search_codebase",
            "Search the codebase for information about specific code components or patterns",
            parameters_schema::<SearchCodebaseArgs>(),
        )
    }

    async fn call(&self, arguments: &str) -> Result<String> {
        let args: SearchCodebaseArgs =
            serde_json::from_str(arguments).context("Invalid search_codebase arguments")?;
        info!("🔍 Searching codebase for: {}", args.query);
        self.query_engine.query(&args.query).await
    }
}

struct AnalyzeDependenciesTool {
    query_engine: QueryEngine,
}

#[async_trait]
impl ToolHandler for AnalyzeDependenciesTool {
    fn definition(&self) -> Tool {
        DeepSeekClient::create_tool(
            "analyze_dependencies",
            "Analyze dependencies between components in the codebase",
            parameters_schema::<AnalyzeDependenciesArgs>(),
        )
    }

    async fn call(&self, arguments: &str) -> Result<String> {
        let args: AnalyzeDependenciesArgs =
            serde_json::from_str(arguments).context("Invalid analyze_dependencies arguments")?;
        info!("🔗 Analyzing dependencies for component: {}", args.component);
        let query = format!(
            "Identify and list all dependencies of {} in the codebase. Include both imports and functional dependencies.",
            args.component
        );
        self.query_engine.query(&query).await
    }
}

// ============================================================================
// Planning agent
// ============================================================================

pub struct PlanningAgent {
    query_engine: QueryEngine,
    model: Arc<dyn LanguageModel>,
    max_iterations: usize,
}

impl PlanningAgent {
    pub fn new(query_engine: QueryEngine, model: Arc<dyn LanguageModel>, max_iterations: usize) -> Self {
        Self {
            query_engine,
            model,
            max_iterations,
        }
    }

    /// Draft a plan with the tool-calling agent, then structure it.
    ///
    /// Agent failures propagate; a narrative that cannot be structured yields
    /// [`Plan::fallback`].
    pub async fn create_implementation_plan(&self, requirement: &str) -> Result<Plan> {
        info!("📝 Creating implementation plan for: {}", requirement);

        let mut agent = Agent::new(self.model.clone())
            .preamble(PLANNER_PREAMBLE)
            .tool(Arc::new(SearchCodebaseTool {
                query_engine: self.query_engine.clone(),
            }))
            .tool(Arc::new(AnalyzeDependenciesTool {
                query_engine: self.query_engine.clone(),
            }))
            .max_turns(self.max_iterations);

        let narrative = agent
            .prompt(&format!(
                "Create a detailed implementation plan for this requirement: {requirement}"
            ))
            .await
            .context("Planning agent failed to produce a plan")?;
        debug!("Plan narrative:\n{}", narrative);

        Ok(self.structure_plan(&narrative).await)
    }

    async fn structure_plan(&self, narrative: &str) -> Plan {
        let prompt = format!(
            r#"Convert the following implementation plan into a structured JSON format:
{narrative}

The JSON must have exactly these keys:
- files_to_modify: array of existing file paths relative to the repository root
- files_to_create: array of new file paths relative to the repository root
- implementation_steps: array of objects {{"description": string, "files": array of file paths the step touches}}
- potential_risks: array of risk descriptions
- tests: array of test descriptions

Return only valid JSON without any explanation.
Do not add any additional fields."#
        );

        let raw = match self.model.complete(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Error structuring plan: {}", e);
                return Plan::fallback(narrative);
            }
        };

        match parse_lenient::<Plan>(&raw) {
            Ok(mut plan) => {
                plan.normalize();
                info!(
                    "✅ Plan ready: {} to modify, {} to create, {} steps",
                    plan.files_to_modify.len(),
                    plan.files_to_create.len(),
                    plan.implementation_steps.len()
                );
                plan
            }
            Err(e) => {
                error!("Error parsing plan to JSON: {:#}", e);
                Plan::fallback(narrative)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deepseek::{FunctionCall, Message, ToolCall};
    use crate::test_support::{canned_query_engine, ScriptedModel};
    use pretty_assertions::assert_eq;

    fn tool_call(name: &str, args: &str) -> Message {
        Message {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_0".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            }]),
            tool_call_id: None,
        }
    }

    #[test]
    fn test_plan_steps_accept_strings_and_objects() {
        let raw = r#"{
            "files_to_modify": ["parser.py"],
            "files_to_create": ["utils/strings.py"],
            "implementation_steps": [
                "Update parser.py to strip whitespace",
                {"description": "Add helper", "files": ["utils/strings.py"]},
                "Run the linters"
            ],
            "potential_risks": ["Behaviour change", {"risk": "perf"}],
            "tests": []
        }"#;

        let mut plan: Plan = serde_json::from_str(raw).unwrap();
        plan.normalize();

        assert_eq!(plan.implementation_steps[0].files, vec!["parser.py".to_string()]);
        assert_eq!(plan.implementation_steps[1].files, vec!["utils/strings.py".to_string()]);
        assert!(plan.implementation_steps[2].files.is_empty());
        assert_eq!(plan.potential_risks[1], r#"{"risk":"perf"}"#);
        assert_eq!(plan.steps_for("./parser.py").len(), 1);
        assert!(plan.raw_plan.is_none());
    }

    #[test]
    fn test_numbered_and_odd_steps_keep_the_plan() {
        let raw = r#"{
            "files_to_modify": ["parser.py"],
            "implementation_steps": [
                {"step": 1, "description": "Validate input in parser.py", "files": ["parser.py"]},
                {"step": 2, "action": "Strip whitespace", "file": "parser.py"},
                {"step": 3, "details": {"note": "document it"}},
                null,
                4
            ],
            "tests": ["whitespace"]
        }"#;

        let plan: Plan = serde_json::from_str(raw).unwrap();

        assert_eq!(plan.files_to_modify, vec!["parser.py".to_string()]);
        let steps = &plan.implementation_steps;
        assert_eq!(steps.len(), 4);
        assert_eq!(
            steps[0],
            PlanStep::new("Validate input in parser.py", vec!["parser.py".to_string()])
        );
        assert_eq!(steps[1], PlanStep::new("Strip whitespace", vec!["parser.py".to_string()]));
        let kept: Value = serde_json::from_str(&steps[2].description).unwrap();
        assert_eq!(kept, serde_json::json!({"step": 3, "details": {"note": "document it"}}));
        assert_eq!(steps[3].description, "4");
        assert_eq!(plan.steps_for("parser.py").len(), 2);
    }

    #[test]
    fn test_fallback_plan_is_empty_with_narrative() {
        let plan = Plan::fallback("just edit everything");
        assert!(plan.files_to_modify.is_empty());
        assert!(plan.implementation_steps.is_empty());
        assert_eq!(plan.raw_plan.as_deref(), Some("just edit everything"));

        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["raw_plan"], "just edit everything");
        assert_eq!(json["tests"], serde_json::json!([]));
    }

    #[test]
    fn test_tool_schemas_describe_arguments() {
        let schema = parameters_schema::<SearchCodebaseArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["query"].is_object());
        assert!(schema.get("$schema").is_none());
    }

    #[tokio::test]
    async fn test_create_plan_uses_tools_and_structures_output() {
        let model = Arc::new(
            ScriptedModel::new(vec![
                "```json\n{\"files_to_modify\": [\"parser.py\"], \"files_to_create\": [], \"implementation_steps\": [\"Edit parser.py\",], \"potential_risks\": [], \"tests\": [\"test parse\"]}\n```",
            ])
            .chats(vec![
                tool_call("search_codebase", r#"{"query": "parser"}"#),
                Message::assistant("Modify parser.py so that parse_input strips whitespace."),
            ]),
        );
        let agent = PlanningAgent::new(canned_query_engine("parser.py defines parse_input"), model.clone(), 5);

        let plan = agent.create_implementation_plan("Strip whitespace").await.unwrap();
        assert_eq!(plan.files_to_modify, vec!["parser.py".to_string()]);
        assert_eq!(plan.implementation_steps[0].files, vec!["parser.py".to_string()]);
        assert_eq!(plan.tests, vec!["test parse".to_string()]);

        let requests = model.chat_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].last().unwrap().text(), "parser.py defines parse_input");
        assert!(model.prompts()[0].contains("parse_input strips whitespace"));
    }

    #[tokio::test]
    async fn test_unparseable_structure_falls_back() {
        let model = Arc::new(
            ScriptedModel::new(vec!["Sorry, I cannot produce JSON"])
                .chats(vec![Message::assistant("Edit the parser")]),
        );
        let agent = PlanningAgent::new(canned_query_engine("ctx"), model, 5);

        let plan = agent.create_implementation_plan("Anything").await.unwrap();
        assert_eq!(plan, Plan::fallback("Edit the parser"));
    }

    #[tokio::test]
    async fn test_agent_failure_propagates() {
        let model = Arc::new(ScriptedModel::new(Vec::<String>::new()));
        let agent = PlanningAgent::new(canned_query_engine("ctx"), model, 5);
        assert!(agent.create_implementation_plan("Anything").await.is_err());
    }
}
