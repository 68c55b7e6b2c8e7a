//! Repository ingestion: walk the tree, skip excluded directories and split every
//! text file into overlapping line-bounded chunks.

use anyhow::{Context, Result};
use rig::Embed;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Directories skipped when the caller does not supply its own list
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &[".git", "__pycache__", ".venv", "venv", "node_modules"];

/// A bounded slice of a source file; the unit of retrieval.
#[derive(Embed, Clone, Deserialize, Debug, Serialize, Eq, PartialEq, Default)]
pub struct CodeChunk {
    pub id: String,
    /// Path relative to the repository root, `/`-separated
    pub file_path: String,
    /// 1-based, inclusive
    pub start_line: usize,
    /// 1-based, inclusive
    pub end_line: usize,
    #[embed]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    pub chunk_lines: usize,
    pub chunk_overlap: usize,
    pub max_chars: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            chunk_lines: 100,
            chunk_overlap: 20,
            max_chars: 4000,
        }
    }
}

impl From<&crate::Config> for ChunkingOptions {
    fn from(config: &crate::Config) -> Self {
        Self {
            chunk_lines: config.chunk_lines,
            chunk_overlap: config.chunk_overlap,
            max_chars: config.max_chars,
        }
    }
}

/// Component for ingesting and chunking repository files.
pub struct CodebaseIngestor {
    repo_path: PathBuf,
    options: ChunkingOptions,
}

impl CodebaseIngestor {
    pub fn new(repo_path: impl Into<PathBuf>, options: ChunkingOptions) -> Self {
        Self {
            repo_path: repo_path.into(),
            options,
        }
    }

    /// Ingest all text files from the repository, skipping `exclude_dirs`
    /// (defaults to [`DEFAULT_EXCLUDE_DIRS`]).
    pub fn ingest(&self, exclude_dirs: Option<&[String]>) -> Result<Vec<CodeChunk>> {
        info!("📥 Ingesting codebase from {}", self.repo_path.display());

        let root = self
            .repo_path
            .canonicalize()
            .with_context(|| format!("Repository path not found: {}", self.repo_path.display()))?;
        let exclude_paths = exclusion_prefixes(&root, exclude_dirs);

        let mut files = 0usize;
        let mut chunks = Vec::new();
        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_excluded(e.path(), &exclude_paths));
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let content = match fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::InvalidData => {
                    debug!("Skipping non-UTF-8 file {}", entry.path().display());
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", entry.path().display()))
                }
            };

            let rel = relative_path(&root, entry.path());
            files += 1;
            chunks.extend(chunk_file(&rel, &content, &self.options));
        }

        info!("Found {} files in repository, split into {} chunks", files, chunks.len());
        Ok(chunks)
    }
}

fn exclusion_prefixes(root: &Path, exclude_dirs: Option<&[String]>) -> Vec<PathBuf> {
    match exclude_dirs {
        Some(dirs) => dirs.iter().map(|d| root.join(d)).collect(),
        None => DEFAULT_EXCLUDE_DIRS.iter().map(|d| root.join(d)).collect(),
    }
}

/// Prefix match on the absolute path, component-wise.
fn is_excluded(path: &Path, exclude_paths: &[PathBuf]) -> bool {
    exclude_paths.iter().any(|excluded| path.starts_with(excluded))
}

/// Repository-relative, `/`-separated form of `path`
pub fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split one file into chunks bounded by line count and character count, with
/// `chunk_overlap` lines shared between consecutive chunks.
pub fn chunk_file(file_path: &str, content: &str, options: &ChunkingOptions) -> Vec<CodeChunk> {
    let max_chars = options.max_chars.max(1);
    let chunk_lines = options.chunk_lines.max(1);
    let overlap = options.chunk_overlap.min(chunk_lines - 1);

    // (line number, text) with over-long lines broken into max_chars pieces
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.chars().count() <= max_chars {
            lines.push((idx + 1, line.to_string()));
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        for piece in chars.chunks(max_chars) {
            lines.push((idx + 1, piece.iter().collect()));
        }
    }

    if lines.iter().all(|(_, text)| text.trim().is_empty()) {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let mut end = start;
        let mut chars = 0usize;
        while end < lines.len() && end - start < chunk_lines {
            let cost = lines[end].1.chars().count() + usize::from(end > start);
            if end > start && chars + cost > max_chars {
                break;
            }
            chars += cost;
            end += 1;
        }

        let body = lines[start..end]
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        chunks.push(CodeChunk {
            id: format!("{}#{}", file_path, chunks.len()),
            file_path: file_path.to_string(),
            start_line: lines[start].0,
            end_line: lines[end - 1].0,
            content: body,
        });

        if end >= lines.len() {
            break;
        }
        // Step back by the overlap but always move forward.
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}
