use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::knowledge::RetrievalMode;

/// Configuration settings for the code change service
#[derive(Debug, Clone)]
pub struct Config {
    pub chat_model: String,
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub test_command: String,
    pub test_timeout_secs: u64,
    pub exclude_dirs: Vec<String>,
    pub chunk_lines: usize,
    pub chunk_overlap: usize,
    pub max_chars: usize,
    pub max_iterations: usize,
    pub top_k: usize,
    pub retrieval: RetrievalMode,
    pub branch_prefix: String,
    pub git_user_name: String,
    pub git_user_email: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn default_exclude_dirs() -> Vec<String> {
    [".git", "__pycache__", ".venv", "venv", "node_modules", "target"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    /// Returns a Config instance with values parsed from environment variables or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chat_model: env::var("CODER_CHAT_MODEL").unwrap_or(defaults.chat_model),
            bind_addr: env::var("CODER_BIND_ADDR").unwrap_or(defaults.bind_addr),
            data_dir: env::var("CODER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            test_command: env::var("CODER_TEST_COMMAND").unwrap_or(defaults.test_command),
            test_timeout_secs: env_parse("CODER_TEST_TIMEOUT_SECS", defaults.test_timeout_secs),
            exclude_dirs: env::var("CODER_EXCLUDE_DIRS")
                .map(|s| {
                    s.split(',')
                        .map(|d| d.trim().to_string())
                        .filter(|d| !d.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.exclude_dirs),
            chunk_lines: env_parse("CODER_CHUNK_LINES", defaults.chunk_lines),
            chunk_overlap: env_parse("CODER_CHUNK_OVERLAP", defaults.chunk_overlap),
            max_chars: env_parse("CODER_MAX_CHARS", defaults.max_chars),
            max_iterations: env_parse("CODER_MAX_ITERATIONS", defaults.max_iterations),
            top_k: env_parse("CODER_TOP_K", defaults.top_k),
            retrieval: env_parse("CODER_RETRIEVAL", defaults.retrieval),
            branch_prefix: env::var("CODER_BRANCH_PREFIX").unwrap_or(defaults.branch_prefix),
            git_user_name: env::var("GIT_USER_NAME").unwrap_or(defaults.git_user_name),
            git_user_email: env::var("GIT_USER_EMAIL").unwrap_or(defaults.git_user_email),
        }
    }

    /// Validate sizes and commands that would otherwise fail deep inside the pipeline
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_lines == 0 || self.max_chars == 0 {
            return Err("chunk_lines and max_chars must be greater than zero".to_string());
        }
        if self.chunk_overlap >= self.chunk_lines {
            return Err(format!(
                "chunk_overlap ({}) must be smaller than chunk_lines ({})",
                self.chunk_overlap, self.chunk_lines
            ));
        }
        if self.test_command.trim().is_empty() {
            return Err("test_command must not be empty".to_string());
        }
        if self.max_iterations == 0 {
            return Err("max_iterations must be at least 1".to_string());
        }
        if self.top_k == 0 {
            return Err("top_k must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn pending_changes_dir(&self) -> PathBuf {
        self.data_dir.join("pending_changes")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("original_files")
    }

    pub fn execution_log_file(&self) -> PathBuf {
        self.data_dir.join("execution.log")
    }

    /// Branch used when committing a given change
    pub fn branch_for(&self, change_id: &str) -> String {
        let short: String = change_id.chars().take(8).collect();
        format!("{}/{}", self.branch_prefix.trim_end_matches('/'), short)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chat_model: crate::deepseek::models::DEEPSEEK_CHAT.to_string(),
            bind_addr: "0.0.0.0:5000".to_string(),
            data_dir: PathBuf::from("./_coder_ai"),
            test_command: "pytest".to_string(),
            test_timeout_secs: 600,
            exclude_dirs: default_exclude_dirs(),
            chunk_lines: 100,
            chunk_overlap: 20,
            max_chars: 4000,
            max_iterations: 20,
            top_k: 5,
            retrieval: RetrievalMode::Semantic,
            branch_prefix: "auto/coder".to_string(),
            git_user_name: "rig-coder".to_string(),
            git_user_email: "rig-coder@localhost".to_string(),
        }
    }
}
