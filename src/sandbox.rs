//! Test stage: generate companion tests, run the test command against a
//! throw-away copy of the repository, and explain failures.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::executor::resolve_in_repo;
use crate::json_repair::parse_lenient;
use crate::llm::{strip_code_fences, LanguageModel};
use crate::planning::Plan;

/// Keep failure prompts bounded; the tail of a test log carries the failures.
const MAX_ANALYZED_OUTPUT: usize = 12_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTests {
    pub generated_tests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TestResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedFix {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub fix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub root_causes: Vec<String>,
    #[serde(default)]
    pub fixes: Vec<SuggestedFix>,
}

impl FailureAnalysis {
    pub fn passed() -> Self {
        Self {
            summary: "All tests passed successfully".to_string(),
            ..Default::default()
        }
    }

    /// Returned when the model's analysis cannot be used
    pub fn unparsed() -> Self {
        Self {
            summary: "Failed to parse test failures".to_string(),
            root_causes: vec!["Unknown".to_string()],
            fixes: vec![SuggestedFix {
                file: "unknown".to_string(),
                issue: "Error parsing test output".to_string(),
                fix: "Manual review needed".to_string(),
            }],
        }
    }
}

// ============================================================================
// Test file naming
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Python,
    JavaScript,
    TypeScript,
    Go,
    Rust,
}

impl Language {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" => Some(Language::Python),
            "js" | "jsx" | "mjs" => Some(Language::JavaScript),
            "ts" | "tsx" => Some(Language::TypeScript),
            "go" => Some(Language::Go),
            "rs" => Some(Language::Rust),
            _ => None,
        }
    }

    fn framework(self) -> &'static str {
        match self {
            Language::Python => "pytest test code for the following Python file",
            Language::JavaScript => "Jest test code for the following JavaScript file",
            Language::TypeScript => "Jest test code for the following TypeScript file",
            Language::Go => "Go tests using the standard testing package for the following Go file",
            Language::Rust => "Rust integration tests for the following Rust file",
        }
    }

    fn fence(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }
}

fn is_test_file(path: &Path, language: Language) -> bool {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    match language {
        Language::Python => stem.starts_with("test_") || stem.ends_with("_test"),
        Language::JavaScript | Language::TypeScript => {
            stem.ends_with(".test") || stem.ends_with(".spec")
        }
        Language::Go => stem.ends_with("_test"),
        Language::Rust => {
            stem.ends_with("_test") || path.components().any(|c| c.as_os_str() == "tests")
        }
    }
}

/// Repository-relative path of the test that accompanies `file_path`, or `None`
/// when the file is not a source file or is a test already.
pub fn companion_test_path(repo_path: &Path, file_path: &str) -> Option<String> {
    let path = Path::new(file_path);
    let language = Language::from_path(path)?;
    if is_test_file(path, language) {
        return None;
    }

    let stem = path.file_stem()?.to_str()?;
    let ext = path.extension()?.to_str()?;
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());

    let test_name = match language {
        Language::Python => format!("test_{stem}.py"),
        Language::JavaScript | Language::TypeScript => format!("{stem}.test.{ext}"),
        Language::Go => format!("{stem}_test.go"),
        Language::Rust => return Some(format!("tests/{stem}_test.rs")),
    };

    // Go tests must share the package directory.
    let dir: PathBuf = if language != Language::Go && repo_path.join("tests").is_dir() {
        match parent.and_then(|p| p.file_name()) {
            Some(name) => Path::new("tests").join(name),
            None => PathBuf::from("tests"),
        }
    } else {
        parent.map(Path::to_path_buf).unwrap_or_default()
    };

    Some(crate::ingest::relative_path(Path::new(""), &dir.join(test_name)))
}

// ============================================================================
// Runner
// ============================================================================

pub struct TestSandboxRunner {
    repo_path: PathBuf,
    model: Arc<dyn LanguageModel>,
    test_command: String,
    timeout: Duration,
}

impl TestSandboxRunner {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        model: Arc<dyn LanguageModel>,
        test_command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            model,
            test_command: test_command.into(),
            timeout,
        }
    }

    /// Write a generated test next to (or under `tests/` for) every source file
    /// the plan touches. Failures are recorded per file.
    pub async fn generate_tests(&self, plan: &Plan) -> GeneratedTests {
        info!("🧪 Generating tests for implemented changes");
        let mut result = GeneratedTests::default();

        for file_path in plan.all_files() {
            let Some(test_path) = companion_test_path(&self.repo_path, file_path) else {
                debug!("No companion test for {}", file_path);
                continue;
            };

            match self.generate_test(file_path, &test_path).await {
                Ok(()) => {
                    info!("Generated test file: {}", test_path);
                    result.generated_tests.push(test_path);
                }
                Err(e) => {
                    let message = format!("Error generating test for {file_path}: {e:#}");
                    error!("{}", message);
                    result.errors.push(message);
                }
            }
        }

        result
    }

    async fn generate_test(&self, file_path: &str, test_path: &str) -> Result<()> {
        let source = resolve_in_repo(&self.repo_path, file_path)?;
        let target = resolve_in_repo(&self.repo_path, test_path)?;
        let language = Language::from_path(&source)
            .ok_or_else(|| anyhow!("unsupported source file {file_path}"))?;

        let file_content = tokio::fs::read_to_string(&source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;

        let prompt = format!(
            "Generate {framework}:\n\n\
             FILE PATH: {file_path}\n\n\
             FILE CONTENT:\n```{fence}\n{file_content}\n```\n\n\
             Please create comprehensive tests that cover the functionality in this file.\n\
             Include appropriate imports, test functions, assertions, and any necessary mocks.\n\
             The test file will be written to {test_path}.\n\
             Return only the test code without any explanations or markdown formatting.",
            framework = language.framework(),
            fence = language.fence(),
        );

        let content = strip_code_fences(&self.model.complete(&prompt).await?);
        debug!("Generated test content for {}:\n{}", file_path, content);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, format!("{content}\n"))
            .await
            .with_context(|| format!("Failed to write {}", target.display()))
    }

    /// Run the test command in a fresh copy of the repository
    pub async fn run_tests(&self) -> TestResult {
        info!("🏃 Running tests in sandbox environment: {}", self.test_command);

        let sandbox = match tempfile::Builder::new().prefix("rig-coder-sandbox").tempdir() {
            Ok(dir) => dir,
            Err(e) => return TestResult::failed(format!("Failed to create sandbox: {e}")),
        };
        let sandbox_repo = sandbox.path().join("sandbox_repo");

        let source = self.repo_path.clone();
        let target = sandbox_repo.clone();
        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &target)).await;
        match copied {
            Ok(Ok(files)) => debug!("Copied {} files into {}", files, sandbox_repo.display()),
            Ok(Err(e)) => return TestResult::failed(format!("Failed to copy repository: {e:#}")),
            Err(e) => return TestResult::failed(format!("Sandbox copy task failed: {e}")),
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.test_command)
            .current_dir(&sandbox_repo)
            .kill_on_drop(true)
            .output();

        let result = match tokio::time::timeout(self.timeout, child).await {
            Err(_) => TestResult::failed(format!(
                "Test command timed out after {}s",
                self.timeout.as_secs_f64()
            )),
            Ok(Err(e)) => TestResult::failed(format!("Failed to run test command: {e}")),
            Ok(Ok(output)) => TestResult {
                success: output.status.success(),
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
                error: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            },
        };

        if result.success {
            info!("✅ Tests passed successfully");
        } else {
            warn!("❌ Tests failed (exit code {:?}): {}", result.exit_code, result.error.trim());
        }
        result
    }

    /// Explain a failed run; a passed run needs no model call
    pub async fn analyze_test_failures(&self, test_results: &TestResult) -> FailureAnalysis {
        if test_results.success {
            return FailureAnalysis::passed();
        }
        info!("🔬 Analyzing test failures");

        let combined = format!("{}{}", test_results.error, test_results.output);
        let error_output = tail(&combined, MAX_ANALYZED_OUTPUT);
        let prompt = format!(
            "Analyze the following test failure output and suggest specific fixes:\n\n\
             TEST OUTPUT:\n{error_output}\n\n\
             Please provide:\n\
             1. A summary of what's failing\n\
             2. The likely root causes\n\
             3. Specific suggestions to fix each issue\n\n\
             Format your response as JSON with keys:\n\
             - 'summary': a brief summary of the failures\n\
             - 'root_causes': an array of potential root causes\n\
             - 'fixes': an array of specific suggestions, each with 'file', 'issue', and 'fix' keys\n\n\
             Return only valid JSON without any explanation."
        );

        let analysis = match self.model.complete(&prompt).await {
            Ok(raw) => parse_lenient::<FailureAnalysis>(&raw).unwrap_or_else(|e| {
                error!("Error parsing analysis to JSON: {:#}", e);
                FailureAnalysis::unparsed()
            }),
            Err(e) => {
                error!("Error requesting failure analysis: {:#}", e);
                FailureAnalysis::unparsed()
            }
        };

        info!("Analysis complete: {}", analysis.summary);
        analysis
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    let start = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[start..]
}

/// Recursively copy `from` into `to`, skipping `.git`
fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    let mut files = 0;
    let walker = WalkDir::new(from)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from)?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Err(e) = fs::copy(entry.path(), &dest) {
                if entry.path_is_symlink() {
                    debug!("Skipping dangling symlink {}: {}", entry.path().display(), e);
                    continue;
                }
                return Err(e).with_context(|| format!("Failed to copy {}", entry.path().display()));
            }
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedModel;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn runner(repo: &Path, model: Arc<ScriptedModel>, command: &str) -> TestSandboxRunner {
        TestSandboxRunner::new(repo, model, command, Duration::from_secs(30))
    }

    #[test]
    fn test_companion_paths_without_tests_dir() {
        let dir = tempdir().unwrap();
        let repo = dir.path();
        assert_eq!(companion_test_path(repo, "parser.py").as_deref(), Some("test_parser.py"));
        assert_eq!(companion_test_path(repo, "pkg/io.py").as_deref(), Some("pkg/test_io.py"));
        assert_eq!(companion_test_path(repo, "web/app.ts").as_deref(), Some("web/app.test.ts"));
        assert_eq!(companion_test_path(repo, "cmd/main.go").as_deref(), Some("cmd/main_test.go"));
        assert_eq!(companion_test_path(repo, "src/lexer.rs").as_deref(), Some("tests/lexer_test.rs"));
        assert_eq!(companion_test_path(repo, "test_parser.py"), None);
        assert_eq!(companion_test_path(repo, "web/app.spec.js"), None);
        assert_eq!(companion_test_path(repo, "README.md"), None);
    }

    #[test]
    fn test_companion_paths_with_tests_dir() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("tests")).unwrap();
        let repo = dir.path();
        assert_eq!(companion_test_path(repo, "parser.py").as_deref(), Some("tests/test_parser.py"));
        assert_eq!(
            companion_test_path(repo, "src/pkg/io.py").as_deref(),
            Some("tests/pkg/test_io.py")
        );
        assert_eq!(companion_test_path(repo, "cmd/main.go").as_deref(), Some("cmd/main_test.go"));
    }

    #[tokio::test]
    async fn test_generate_tests_writes_companion_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("parser.py"), "def parse_input(s):\n    return s\n").unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            "```python\nfrom parser import parse_input\n\ndef test_parse():\n    assert parse_input('a') == 'a'\n```",
        ]));
        let plan = Plan {
            files_to_modify: vec!["parser.py".to_string(), "test_other.py".to_string()],
            files_to_create: vec!["notes.md".to_string(), "gone.py".to_string()],
            ..Default::default()
        };

        let generated = runner(dir.path(), model.clone(), "true").generate_tests(&plan).await;
        assert_eq!(generated.generated_tests, vec!["test_parser.py".to_string()]);
        assert_eq!(generated.errors.len(), 1);
        assert!(generated.errors[0].contains("gone.py"));

        let written = fs::read_to_string(dir.path().join("test_parser.py")).unwrap();
        assert!(written.starts_with("from parser import parse_input"));
        assert!(model.prompts()[0].contains("pytest"));
    }

    #[tokio::test]
    async fn test_run_tests_in_isolated_copy() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("marker.txt"), "present").unwrap();
        let model = Arc::new(ScriptedModel::default());

        let result = runner(dir.path(), model, "cat marker.txt && touch sandbox_only")
            .run_tests()
            .await;
        assert!(result.success);
        assert_eq!(result.output, "present");
        assert_eq!(result.exit_code, Some(0));
        assert!(!dir.path().join("sandbox_only").exists());
    }

    #[tokio::test]
    async fn test_run_tests_reports_failure() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::default());

        let result = runner(dir.path(), model, "echo boom >&2; exit 3").run_tests().await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.error.trim(), "boom");
    }

    #[tokio::test]
    async fn test_run_tests_times_out() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::default());
        let runner = TestSandboxRunner::new(dir.path(), model, "sleep 5", Duration::from_millis(200));

        let result = runner.run_tests().await;
        assert!(!result.success);
        assert!(result.error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_analysis_of_passing_run_skips_model() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::default());
        let passed = TestResult {
            success: true,
            ..Default::default()
        };

        let analysis = runner(dir.path(), model.clone(), "true").analyze_test_failures(&passed).await;
        assert_eq!(analysis, FailureAnalysis::passed());
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_analysis_parses_model_json() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"summary": "parse_input crashes", "root_causes": ["None input",], "fixes": [{"file": "parser.py", "issue": "no guard", "fix": "check for None"}]}"#,
        ]));
        let failed = TestResult::failed("TypeError: NoneType");

        let analysis = runner(dir.path(), model.clone(), "true").analyze_test_failures(&failed).await;
        assert_eq!(analysis.summary, "parse_input crashes");
        assert_eq!(analysis.fixes[0].file, "parser.py");
        assert!(model.prompts()[0].contains("TypeError: NoneType"));
    }

    #[tokio::test]
    async fn test_unparseable_analysis_uses_placeholder() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec!["the tests are broken"]));

        let analysis = runner(dir.path(), model, "true")
            .analyze_test_failures(&TestResult::failed("boom"))
            .await;
        assert_eq!(analysis, FailureAnalysis::unparsed());
    }

    #[test]
    fn test_tail_keeps_end_of_output() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
    }
}
