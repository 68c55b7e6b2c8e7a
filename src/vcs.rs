use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::executor::ExecutionResult;
use crate::llm::LanguageModel;
use crate::planning::Plan;

/// Author recorded on generated commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl From<&crate::Config> for GitIdentity {
    fn from(config: &crate::Config) -> Self {
        Self {
            name: config.git_user_name.clone(),
            email: config.git_user_email.clone(),
        }
    }
}

fn run(cwd: &Path, prog: &str, args: &[&str]) -> Result<String> {
    let out = Command::new(prog).args(args).current_dir(cwd).output()?;
    if !out.status.success() {
        return Err(anyhow!(
            "{prog} {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

/// Commits accepted changes on a dedicated branch
pub struct VcsIntegrator {
    repo_path: PathBuf,
    branch_name: String,
    identity: GitIdentity,
    model: Arc<dyn LanguageModel>,
}

impl VcsIntegrator {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        branch_name: impl Into<String>,
        identity: GitIdentity,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            branch_name: branch_name.into(),
            identity,
            model,
        }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        run(&self.repo_path, "git", args)
    }

    fn is_repository(&self) -> bool {
        match self.git(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.trim() == "true",
            Err(e) => {
                error!("No git repository at {}: {}", self.repo_path.display(), e);
                false
            }
        }
    }

    fn current_branch(&self) -> Option<String> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Create and check out `branch_name`, or check it out if it already exists
    pub fn create_branch(&self, branch_name: &str) -> bool {
        if !self.is_repository() {
            return false;
        }
        if self.current_branch().as_deref() == Some(branch_name) {
            return true;
        }

        match self.git(&["checkout", "-b", branch_name]) {
            Ok(_) => {
                info!("🌿 Created and checked out branch: {}", branch_name);
                true
            }
            Err(create_err) => match self.git(&["checkout", branch_name]) {
                Ok(_) => {
                    info!("🌿 Checked out existing branch: {}", branch_name);
                    true
                }
                Err(e) => {
                    error!("Failed to create branch {}: {} / {}", branch_name, create_err, e);
                    false
                }
            },
        }
    }

    /// Stage everything and commit on the integrator's branch
    pub fn commit_changes(&self, message: &str) -> bool {
        if !self.is_repository() || !self.create_branch(&self.branch_name) {
            return false;
        }

        let user_name = format!("user.name={}", self.identity.name);
        let user_email = format!("user.email={}", self.identity.email);
        let committed = self.git(&["add", "-A"]).and_then(|_| {
            self.git(&["-c", &user_name, "-c", &user_email, "commit", "-m", message])
        });

        match committed {
            Ok(_) => {
                let summary = message.lines().next().unwrap_or_default();
                info!("✅ Committed changes on {}: {}", self.branch_name, summary);
                true
            }
            Err(e) => {
                error!("Failed to commit changes: {}", e);
                false
            }
        }
    }

    pub async fn generate_commit_message(&self, plan: &Plan, changes: &ExecutionResult) -> Result<String> {
        let steps: Vec<&str> = plan
            .implementation_steps
            .iter()
            .map(|s| s.description.as_str())
            .collect();
        let prompt = format!(
            "Generate a clear and descriptive git commit message for the following code changes:\n\n\
             MODIFIED FILES:\n{:?}\n\n\
             CREATED FILES:\n{:?}\n\n\
             IMPLEMENTATION STEPS:\n{:?}\n\n\
             Follow these guidelines:\n\
             1. Start with a brief summary line (max 50 chars)\n\
             2. Add a blank line after the summary\n\
             3. Include bullet points with key changes\n\
             4. Keep the message concise but informative\n\n\
             Return only the commit message without any explanation.",
            changes.modified_files, changes.created_files, steps
        );

        let message = crate::llm::strip_code_fences(&self.model.complete(&prompt).await?);
        if message.is_empty() {
            warn!("Model returned an empty commit message");
            return Ok(fallback_message(changes));
        }
        Ok(message)
    }
}

fn fallback_message(changes: &ExecutionResult) -> String {
    let mut message = String::from("Apply generated code changes\n");
    for file in changes.modified_files.iter().chain(&changes.created_files) {
        message.push_str(&format!("\n- {file}"));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedModel;
    use std::fs;
    use tempfile::tempdir;

    fn identity() -> GitIdentity {
        GitIdentity {
            name: "Test Bot".to_string(),
            email: "bot@example.com".to_string(),
        }
    }

    fn init_repo(path: &Path) {
        run(path, "git", &["init", "-q"]).unwrap();
        fs::write(path.join("parser.py"), "X = 1\n").unwrap();
        run(path, "git", &["add", "-A"]).unwrap();
        run(
            path,
            "git",
            &["-c", "user.name=t", "-c", "user.email=t@t", "commit", "-q", "-m", "init"],
        )
        .unwrap();
    }

    fn integrator(path: &Path, branch: &str) -> VcsIntegrator {
        VcsIntegrator::new(path, branch, identity(), Arc::new(ScriptedModel::default()))
    }

    #[test]
    fn test_commit_on_dedicated_branch() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        fs::write(dir.path().join("parser.py"), "X = 2\n").unwrap();

        let vcs = integrator(dir.path(), "auto/coder/abcd1234");
        assert!(vcs.commit_changes("Update parser\n\n- bump X"));

        let branch = run(dir.path(), "git", &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
        assert_eq!(branch.trim(), "auto/coder/abcd1234");
        let log = run(dir.path(), "git", &["log", "-1", "--format=%an <%ae>|%s"]).unwrap();
        assert_eq!(log.trim(), "Test Bot <bot@example.com>|Update parser");
    }

    #[test]
    fn test_create_branch_reuses_existing_branch() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let vcs = integrator(dir.path(), "feature");

        assert!(vcs.create_branch("feature"));
        run(dir.path(), "git", &["checkout", "-q", "-"]).unwrap();
        assert!(vcs.create_branch("feature"));
    }

    #[test]
    fn test_nothing_to_commit_reports_failure() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        assert!(!integrator(dir.path(), "empty").commit_changes("No changes"));
    }

    #[test]
    fn test_not_a_repository() {
        let dir = tempdir().unwrap();
        let vcs = integrator(dir.path(), "b");
        assert!(!vcs.create_branch("b"));
        assert!(!vcs.commit_changes("msg"));
    }

    #[tokio::test]
    async fn test_generate_commit_message() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec!["  Strip parser input\n\n- trim whitespace  "]));
        let vcs = VcsIntegrator::new(dir.path(), "b", identity(), model.clone());
        let changes = ExecutionResult {
            modified_files: vec!["parser.py".to_string()],
            ..Default::default()
        };

        let message = vcs.generate_commit_message(&Plan::default(), &changes).await.unwrap();
        assert_eq!(message, "Strip parser input\n\n- trim whitespace");
        assert!(model.prompts()[0].contains("[\"parser.py\"]"));
    }

    #[test]
    fn test_fallback_message_lists_files() {
        let changes = ExecutionResult {
            modified_files: vec!["a.py".to_string()],
            created_files: vec!["b.py".to_string()],
            errors: vec![],
        };
        assert_eq!(
            fallback_message(&changes),
            "Apply generated code changes\n\n- a.py\n- b.py"
        );
    }
}
