use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info};

use crate::knowledge::QueryEngine;
use crate::llm::{strip_code_fences, LanguageModel};
use crate::planning::{Plan, PlanStep};

/// Outcome of one pass over a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub modified_files: Vec<String>,
    pub created_files: Vec<String>,
    pub errors: Vec<String>,
}

/// Applies a plan to the working tree, one file at a time
pub struct ChangeExecutor {
    repo_path: PathBuf,
    query_engine: QueryEngine,
    model: Arc<dyn LanguageModel>,
}

impl ChangeExecutor {
    pub fn new(repo_path: impl Into<PathBuf>, query_engine: QueryEngine, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            repo_path: repo_path.into(),
            query_engine,
            model,
        }
    }

    /// Rewrite every file to modify, then create every new file. Each file is
    /// independent: a failure is recorded in `errors` and the pass continues.
    pub async fn execute_plan(&self, plan: &Plan) -> ExecutionResult {
        info!("🛠️ Executing implementation plan");
        let mut result = ExecutionResult::default();

        for file_path in &plan.files_to_modify {
            let full_path = match resolve_in_repo(&self.repo_path, file_path) {
                Ok(path) => path,
                Err(e) => {
                    record(&mut result, format!("Error modifying {file_path}: {e}"));
                    continue;
                }
            };
            if !full_path.is_file() {
                record(&mut result, format!("File not found: {file_path}"));
                continue;
            }

            match self.modify_file(file_path, &full_path, plan).await {
                Ok(()) => {
                    info!("✏️ Modified file: {}", file_path);
                    result.modified_files.push(file_path.clone());
                }
                Err(e) => record(&mut result, format!("Error modifying {file_path}: {e:#}")),
            }
        }

        for file_path in &plan.files_to_create {
            let created = match resolve_in_repo(&self.repo_path, file_path) {
                Ok(full_path) => self.create_file(file_path, &full_path, plan).await,
                Err(e) => Err(e),
            };
            match created {
                Ok(()) => {
                    info!("📄 Created file: {}", file_path);
                    result.created_files.push(file_path.clone());
                }
                Err(e) => record(&mut result, format!("Error creating {file_path}: {e:#}")),
            }
        }

        info!(
            "Execution finished: {} modified, {} created, {} errors",
            result.modified_files.len(),
            result.created_files.len(),
            result.errors.len()
        );
        result
    }

    async fn modify_file(&self, file_path: &str, full_path: &Path, plan: &Plan) -> Result<()> {
        let original_content = fs::read_to_string(full_path)
            .await
            .with_context(|| format!("Failed to read {}", full_path.display()))?;
        let file_context = self
            .query_engine
            .query(&format!(
                "Provide context and information about the file {file_path}, including its purpose and how it's used in the codebase."
            ))
            .await?;

        let prompt = format!(
            "I need to modify the following file according to these implementation steps:\n\n\
             FILE PATH: {file_path}\n\n\
             ORIGINAL CONTENT:\n```\n{original_content}\n```\n\n\
             RELEVANT IMPLEMENTATION STEPS:\n{steps}\n\n\
             ADDITIONAL CONTEXT FROM CODEBASE:\n{file_context}\n\n\
             Please generate the complete new content for this file with all necessary changes implemented.\n\
             Return only the file content without any explanations or markdown formatting.",
            steps = format_steps(&plan.steps_for(file_path)),
        );

        let new_content = strip_code_fences(&self.model.complete(&prompt).await?);
        fs::write(full_path, with_trailing_newline(new_content))
            .await
            .with_context(|| format!("Failed to write {}", full_path.display()))
    }

    async fn create_file(&self, file_path: &str, full_path: &Path, plan: &Plan) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let extension = Path::new(file_path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let similar_files = self
            .query_engine
            .query(&format!(
                "Find examples of files with {extension} extension in the codebase and summarize their structure and patterns."
            ))
            .await?;

        let prompt = format!(
            "I need to create a new file according to these implementation steps:\n\n\
             FILE PATH: {file_path}\n\n\
             RELEVANT IMPLEMENTATION STEPS:\n{steps}\n\n\
             SIMILAR FILES CONTEXT:\n{similar_files}\n\n\
             Please generate the complete content for this new file.\n\
             Return only the file content without any explanations or markdown formatting.",
            steps = format_steps(&plan.steps_for(file_path)),
        );

        let new_content = strip_code_fences(&self.model.complete(&prompt).await?);
        fs::write(full_path, with_trailing_newline(new_content))
            .await
            .with_context(|| format!("Failed to write {}", full_path.display()))
    }
}

fn record(result: &mut ExecutionResult, message: String) {
    error!("{}", message);
    result.errors.push(message);
}

fn format_steps(steps: &[&PlanStep]) -> String {
    if steps.is_empty() {
        return "(no step names this file explicitly)".to_string();
    }
    steps
        .iter()
        .map(|s| format!("- {}", s.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn with_trailing_newline(mut content: String) -> String {
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content
}

/// Join a plan path onto the repository, refusing absolute paths and `..`
pub fn resolve_in_repo(repo_path: &Path, file_path: &str) -> Result<PathBuf> {
    let relative = Path::new(file_path.trim());
    if relative.as_os_str().is_empty() {
        bail!("empty path");
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("path escapes the repository"),
        }
    }
    Ok(repo_path.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{canned_query_engine, ScriptedModel};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_empty_plan_changes_nothing() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::default());
        let executor = ChangeExecutor::new(dir.path(), canned_query_engine("ctx"), model.clone());

        let result = executor.execute_plan(&Plan::default()).await;
        assert_eq!(result, ExecutionResult::default());
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_does_not_stop_the_batch() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("parser.py"), "def parse_input(s):\n    return s\n").unwrap();

        let model = Arc::new(ScriptedModel::default().responding(|prompt| {
            if prompt.contains("FILE PATH: parser.py") {
                Some("```python\ndef parse_input(s):\n    return s.strip()\n```".to_string())
            } else {
                Some("VALUE = 1".to_string())
            }
        }));
        let executor = ChangeExecutor::new(dir.path(), canned_query_engine("ctx"), model.clone());
        let plan = Plan {
            files_to_modify: vec!["missing.py".to_string(), "parser.py".to_string()],
            files_to_create: vec!["pkg/constants.py".to_string()],
            implementation_steps: vec![PlanStep::new("Strip input in parser.py", vec!["parser.py".to_string()])],
            ..Default::default()
        };

        let result = executor.execute_plan(&plan).await;
        assert_eq!(result.errors, vec!["File not found: missing.py".to_string()]);
        assert_eq!(result.modified_files, vec!["parser.py".to_string()]);
        assert_eq!(result.created_files, vec!["pkg/constants.py".to_string()]);

        let parser = std::fs::read_to_string(dir.path().join("parser.py")).unwrap();
        assert_eq!(parser, "def parse_input(s):\n    return s.strip()\n");
        let created = std::fs::read_to_string(dir.path().join("pkg/constants.py")).unwrap();
        assert_eq!(created, "VALUE = 1\n");
        assert!(model.prompts()[0].contains("- Strip input in parser.py"));
    }

    #[tokio::test]
    async fn test_model_failure_is_recorded_per_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "A = 1\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "B = 1\n").unwrap();

        let model = Arc::new(ScriptedModel::default().responding(|prompt| {
            (!prompt.contains("FILE PATH: a.py")).then(|| "B = 2".to_string())
        }));
        let executor = ChangeExecutor::new(dir.path(), canned_query_engine("ctx"), model);
        let plan = Plan {
            files_to_modify: vec!["a.py".to_string(), "b.py".to_string()],
            ..Default::default()
        };

        let result = executor.execute_plan(&plan).await;
        assert_eq!(result.modified_files, vec!["b.py".to_string()]);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Error modifying a.py:"));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.py")).unwrap(), "A = 1\n");
    }

    #[tokio::test]
    async fn test_paths_outside_repository_are_rejected() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        let model = Arc::new(ScriptedModel::default().responding(|_| Some("x".to_string())));
        let executor = ChangeExecutor::new(&repo, canned_query_engine("ctx"), model);
        let plan = Plan {
            files_to_create: vec!["../escape.py".to_string(), "/etc/owned".to_string()],
            ..Default::default()
        };

        let result = executor.execute_plan(&plan).await;
        assert!(result.created_files.is_empty());
        assert_eq!(result.errors.len(), 2);
        assert!(!dir.path().join("escape.py").exists());
    }
}
