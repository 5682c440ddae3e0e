//! `search.query` / `search.regex` (§4.G): bounded substring and regex scans
//! over a directory tree, honoring an optional include-pattern filter and
//! scoring matches so phrase hits and word-start hits rank above a bare
//! substring match. Grounded on `fs_tools.rs`'s `SearchFilesTool` tree-walk
//! and binary-file skip heuristic.

use std::path::{Path, PathBuf};

use regex::Regex;
use rlm_core::error::{Result, RlmError};

use crate::fs::SharedFileSystem;

const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "build", "dist", "__pycache__", ".git"];

const BINARY_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "a", "o", "obj", "png", "jpg", "jpeg", "gif", "bmp", "ico",
    "webp", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "pdf", "wasm", "pyc", "pyo", "class",
];

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub path: String,
    pub line_number: usize,
    pub line: String,
    pub score: i64,
}

fn is_likely_binary(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .map(|ext| BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn matches_include_patterns(name: &str, patterns: Option<&[String]>) -> bool {
    match patterns {
        None => true,
        Some(patterns) if patterns.is_empty() => true,
        Some(patterns) => patterns.iter().any(|p| glob_match(p, name)),
    }
}

/// Minimal glob match supporting a single leading/trailing `*` (the common
/// `*.rs` / `test_*` shapes), matching `ListDirectoryTool::matches_pattern`.
fn glob_match(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        return name.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    pattern == name
}

/// Scores one line match: phrase matches and word-start matches outrank a
/// bare substring hit anywhere mid-word.
fn score_match(line: &str, query: &str, match_start: usize) -> i64 {
    let mut score = 1i64;
    if line.trim() == query.trim() {
        score += 3;
    }
    let starts_word = match_start == 0
        || line[..match_start]
            .chars()
            .next_back()
            .map(|c| !c.is_alphanumeric() && c != '_')
            .unwrap_or(true);
    if starts_word {
        score += 2;
    }
    score
}

async fn walk(
    fs: &SharedFileSystem,
    dir: &Path,
    root: &Path,
    include_patterns: Option<&[String]>,
    max_results: usize,
    mut visit_file: impl AsyncFnMut(&Path, &str) -> Vec<SearchHit>,
    hits: &mut Vec<SearchHit>,
) {
    if hits.len() >= max_results {
        return;
    }
    let entries = match fs.list_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries {
        if hits.len() >= max_results {
            return;
        }
        if entry.name.starts_with('.') {
            continue;
        }
        if entry.is_dir {
            if SKIPPED_DIRS.contains(&entry.name.as_str()) {
                continue;
            }
            Box::pin(walk(
                fs,
                &entry.path,
                root,
                include_patterns,
                max_results,
                &mut visit_file,
                hits,
            ))
            .await;
            continue;
        }
        if is_likely_binary(&entry.name) || !matches_include_patterns(&entry.name, include_patterns) {
            continue;
        }
        let content = match fs.read_file(&entry.path).await {
            Ok(c) => c,
            Err(_) => continue,
        };
        let relative = entry.path.strip_prefix(root).unwrap_or(&entry.path).display().to_string();
        hits.extend(visit_file(&entry.path, &content).into_iter().map(|mut h| {
            h.path = relative.clone();
            h
        }));
    }
}

pub async fn search_substring(
    fs: &SharedFileSystem,
    root: &Path,
    query: &str,
    include_patterns: Option<&[String]>,
    case_sensitive: bool,
    max_results: usize,
) -> Result<Vec<SearchHit>> {
    if query.is_empty() {
        return Err(RlmError::InvalidRequest("search query must not be empty".to_string()));
    }
    let needle = if case_sensitive { query.to_string() } else { query.to_lowercase() };
    let mut hits = Vec::new();
    walk(
        fs,
        root,
        root,
        include_patterns,
        max_results,
        |_path, content| {
            let mut line_hits = Vec::new();
            for (i, line) in content.lines().enumerate() {
                let haystack = if case_sensitive { line.to_string() } else { line.to_lowercase() };
                if let Some(pos) = haystack.find(&needle) {
                    line_hits.push(SearchHit {
                        path: String::new(),
                        line_number: i + 1,
                        line: line.to_string(),
                        score: score_match(line, query, pos),
                    });
                }
            }
            line_hits
        },
        &mut hits,
    )
    .await;
    hits.sort_by(|a, b| b.score.cmp(&a.score));
    hits.truncate(max_results);
    Ok(hits)
}

pub async fn search_regex(
    fs: &SharedFileSystem,
    root: &Path,
    pattern: &str,
    include_patterns: Option<&[String]>,
    case_sensitive: bool,
    max_results: usize,
) -> Result<Vec<SearchHit>> {
    let regex = if case_sensitive {
        Regex::new(pattern)
    } else {
        regex::RegexBuilder::new(pattern).case_insensitive(true).build()
    }
    .map_err(|e| RlmError::InvalidRequest(format!("invalid regex pattern: {e}")))?;

    let mut hits = Vec::new();
    walk(
        fs,
        root,
        root,
        include_patterns,
        max_results,
        |_path, content| {
            let mut line_hits = Vec::new();
            for (i, line) in content.lines().enumerate() {
                if let Some(m) = regex.find(line) {
                    line_hits.push(SearchHit {
                        path: String::new(),
                        line_number: i + 1,
                        line: line.to_string(),
                        score: score_match(line, m.as_str(), m.start()),
                    });
                }
            }
            line_hits
        },
        &mut hits,
    )
    .await;
    hits.sort_by(|a, b| b.score.cmp(&a.score));
    hits.truncate(max_results);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFileSystem;
    use std::sync::Arc;

    fn fixture() -> SharedFileSystem {
        Arc::new(
            MockFileSystem::new()
                .with_directory("/repo")
                .with_file("/repo/a.rs", "fn alpha() {}\nfn beta() {}\n")
                .with_file("/repo/b.rs", "let x = alpha_helper();\n")
                .with_file("/repo/image.png", "not really text"),
        )
    }

    #[tokio::test]
    async fn substring_search_finds_matches_across_files() {
        let fs = fixture();
        let hits = search_substring(&fs, Path::new("/repo"), "alpha", None, false, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn word_start_matches_rank_above_mid_word_matches() {
        let fs = fixture();
        let hits = search_substring(&fs, Path::new("/repo"), "alpha", None, false, 10)
            .await
            .unwrap();
        assert!(hits[0].line.contains("fn alpha"));
    }

    #[tokio::test]
    async fn binary_files_are_skipped() {
        let fs = fixture();
        let hits = search_substring(&fs, Path::new("/repo"), "text", None, false, 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn include_patterns_filter_by_extension() {
        let fs = fixture();
        let patterns = vec!["*.rs".to_string()];
        let hits = search_substring(&fs, Path::new("/repo"), "alpha", Some(&patterns), false, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn regex_search_matches_patterns() {
        let fs = fixture();
        let hits = search_regex(&fs, Path::new("/repo"), r"fn \w+\(\)", None, false, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn empty_query_is_invalid_request() {
        let fs = fixture();
        let err = search_substring(&fs, Path::new("/repo"), "", None, false, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, RlmError::InvalidRequest(_)));
    }
}
