//! End-to-end pipeline: plan, execute, generate tests, run them and, on
//! failure, analyze. Committing is a separate, explicit step.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::executor::{ChangeExecutor, ExecutionResult};
use crate::ingest::{ChunkingOptions, CodebaseIngestor};
use crate::knowledge::{KnowledgeBuilder, KnowledgeIndex, QueryEngine};
use crate::llm::LanguageModel;
use crate::planning::{Plan, PlanningAgent};
use crate::sandbox::{FailureAnalysis, GeneratedTests, TestResult, TestSandboxRunner};
use crate::store::change_id_for;
use crate::trace::{ExecutionLog, ExecutionTrace};

/// Everything one pipeline run produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResults {
    pub requirement: String,
    pub plan: Plan,
    pub changes: ExecutionResult,
    pub tests: GeneratedTests,
    pub test_results: TestResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<FailureAnalysis>,
    /// Set when the tests failed; such a change must not be committed blindly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_warning: Option<String>,
}

impl PipelineResults {
    pub fn new(requirement: &str) -> Self {
        Self {
            requirement: requirement.to_string(),
            ..Default::default()
        }
    }
}

pub struct AgentSystem {
    repo_path: PathBuf,
    indexed_chunks: usize,
    planning_agent: PlanningAgent,
    change_executor: ChangeExecutor,
    test_runner: TestSandboxRunner,
    log: ExecutionLog,
}

impl AgentSystem {
    /// Load the index at `index_path` when present, otherwise ingest the
    /// repository, build a fresh index and save it to `index_path` if given.
    pub async fn open(
        repo_path: impl Into<PathBuf>,
        index_path: Option<&Path>,
        config: &Config,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let repo_path = repo_path.into();
        if !repo_path.is_dir() {
            anyhow::bail!("Repository path not found: {}", repo_path.display());
        }
        let builder = KnowledgeBuilder::new(config.retrieval);

        let index = match index_path {
            Some(path) if KnowledgeBuilder::exists(path) => builder.load(path)?,
            _ => {
                info!("Index not found or not provided. Building new index.");
                let ingestor = CodebaseIngestor::new(&repo_path, ChunkingOptions::from(config));
                let chunks = ingestor.ingest(Some(&config.exclude_dirs))?;
                let index = builder.build(chunks).await?;
                if let Some(path) = index_path {
                    builder.save(&index, path)?;
                }
                index
            }
        };

        Ok(Self::with_index(repo_path, index, config, model))
    }

    pub fn with_index(
        repo_path: PathBuf,
        index: KnowledgeIndex,
        config: &Config,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let indexed_chunks = index.len();
        let query_engine = QueryEngine::new(Arc::new(index), model.clone(), config.top_k);

        Self {
            planning_agent: PlanningAgent::new(query_engine.clone(), model.clone(), config.max_iterations),
            change_executor: ChangeExecutor::new(&repo_path, query_engine, model.clone()),
            test_runner: TestSandboxRunner::new(
                &repo_path,
                model,
                config.test_command.clone(),
                config.test_timeout(),
            ),
            log: ExecutionLog::new(config.execution_log_file()),
            indexed_chunks,
            repo_path,
        }
    }

    pub fn indexed_chunks(&self) -> usize {
        self.indexed_chunks
    }

    fn trace(&self, trace: ExecutionTrace) {
        if let Err(e) = self.log.record(&trace) {
            warn!("Failed to write execution trace: {}", e);
        }
    }

    pub async fn process_requirement(&self, requirement: &str) -> Result<PipelineResults> {
        let change_id = change_id_for(requirement);
        info!("🚀 Processing requirement for {}: {}", self.repo_path.display(), requirement);
        let mut results = PipelineResults::new(requirement);

        results.plan = match self.planning_agent.create_implementation_plan(requirement).await {
            Ok(plan) => plan,
            Err(e) => {
                self.trace(
                    ExecutionTrace::new(&change_id, "PLAN", "FAILED", "planning agent failed")
                        .with_error(format!("{e:#}")),
                );
                return Err(e).context("Failed to create implementation plan");
            }
        };
        let plan_status = if results.plan.raw_plan.is_some() { "FALLBACK" } else { "SUCCESS" };
        self.trace(ExecutionTrace::new(
            &change_id,
            "PLAN",
            plan_status,
            format!(
                "{} to modify, {} to create",
                results.plan.files_to_modify.len(),
                results.plan.files_to_create.len()
            ),
        ));

        results.changes = self.change_executor.execute_plan(&results.plan).await;
        let mut execute = ExecutionTrace::new(
            &change_id,
            "EXECUTE",
            if results.changes.errors.is_empty() { "SUCCESS" } else { "PARTIAL" },
            format!(
                "modified {:?}, created {:?}",
                results.changes.modified_files, results.changes.created_files
            ),
        );
        if !results.changes.errors.is_empty() {
            execute = execute.with_error(results.changes.errors.join("; "));
        }
        self.trace(execute);

        results.tests = self.test_runner.generate_tests(&results.plan).await;
        self.trace(ExecutionTrace::new(
            &change_id,
            "GENERATE_TESTS",
            if results.tests.errors.is_empty() { "SUCCESS" } else { "PARTIAL" },
            format!("{:?}", results.tests.generated_tests),
        ));

        results.test_results = self.test_runner.run_tests().await;
        if results.test_results.success {
            self.trace(ExecutionTrace::new(&change_id, "RUN_TESTS", "SUCCESS", "all tests passed"));
        } else {
            self.trace(
                ExecutionTrace::new(
                    &change_id,
                    "RUN_TESTS",
                    "FAILED",
                    format!("exit code {:?}", results.test_results.exit_code),
                )
                .with_error(results.test_results.error.trim()),
            );

            let analysis = self.test_runner.analyze_test_failures(&results.test_results).await;
            results.commit_warning = Some(format!(
                "Tests failed with the following analysis: {} !! DO NOT COMMIT !!",
                analysis.summary
            ));
            self.trace(ExecutionTrace::new(&change_id, "ANALYZE", "DONE", analysis.summary.clone()));
            results.analysis = Some(analysis);
        }

        info!("🏁 Pipeline finished for change {}", change_id);
        Ok(results)
    }
}
