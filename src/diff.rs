use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// Before/after view of one file touched by a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// `None` for files the change created
    pub original: Option<String>,
    pub current: String,
    pub diff: String,
}

/// Unified diff between `original` and `current` with `a/` and `b/` headers
pub fn unified_diff(file_path: &str, original: &str, current: &str) -> String {
    if original == current {
        return String::new();
    }
    TextDiff::from_lines(original, current)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{file_path}"), &format!("b/{file_path}"))
        .to_string()
}

pub fn modified_file(file_path: &str, original: Option<String>, current: String) -> FileChange {
    let diff = unified_diff(file_path, original.as_deref().unwrap_or_default(), &current);
    FileChange {
        original,
        current,
        diff,
    }
}

pub fn created_file(file_path: &str, current: String) -> FileChange {
    FileChange {
        original: None,
        diff: format!("New file: {file_path}\n\n{current}"),
        current,
    }
}
