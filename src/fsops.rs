//! Blocking filesystem operations, offloaded to the worker pool
//!
//! The Docker backend has direct POSIX access to the shared projects volume;
//! every walk, copy and search here runs under `spawn_blocking` so the event
//! loop never stalls on disk I/O. Listings and searches skip dependency
//! trees, VCS metadata and binary files by a fixed exclude list.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::Pattern;
use regex::RegexBuilder;
use serde::Serialize;
use walkdir::WalkDir;

/// Directories never descended into during listings and searches.
pub const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    ".next",
    "dist",
    "build",
    ".venv",
    "venv",
    ".cache",
    ".turbo",
    "coverage",
    ".nyc_output",
];

/// Files never returned from listings.
pub const EXCLUDED_FILES: &[&str] = &[".DS_Store", "Thumbs.db", ".env.local"];

/// Extensions treated as binary and skipped by content reads.
pub const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "svg", "webp", "bmp", "woff", "woff2", "ttf", "eot",
    "otf", "mp3", "mp4", "wav", "ogg", "webm", "avi", "mov", "pdf", "doc", "docx", "xls",
    "xlsx", "ppt", "pptx", "zip", "tar", "gz", "rar", "7z", "bin", "exe", "dll", "so",
    "dylib", "class", "jar", "pyc", "pyo", "lock", "map",
];

/// A file or directory in a listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// A content-search hit.
#[derive(Debug, Clone, Serialize)]
pub struct GrepMatch {
    pub file: String,
    pub line: u64,
    pub content: String,
}

pub fn is_excluded_dir(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name)
}

pub fn is_binary_name(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .map(|ext| BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn walk(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && is_excluded_dir(&name))
        })
        .filter_map(|e| e.ok())
}

/// Read a UTF-8 file, returning None when it does not exist.
pub async fn read_to_string(path: PathBuf) -> Result<Option<String>> {
    tokio::task::spawn_blocking(move || {
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("failed to read {}", path.display()))
    })
    .await?
}

/// Write a file, creating parent directories as needed.
pub async fn write_string(path: PathBuf, content: String) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
    })
    .await?
}

/// Remove a file; missing files are fine.
pub async fn remove_file(path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
    })
    .await?
}

pub async fn create_dir_all(path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))
    })
    .await?
}

/// Remove a directory tree; missing trees are fine.
pub async fn remove_tree(path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || match std::fs::remove_dir_all(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    })
    .await?
}

pub async fn rename(from: PathBuf, to: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::rename(&from, &to).with_context(|| {
            format!("failed to rename {} -> {}", from.display(), to.display())
        })
    })
    .await?
}

/// Copy a directory tree, skipping entries matching `exclude_patterns`
/// (exact names or `*.ext` suffix patterns).
pub async fn copy_tree(src: PathBuf, dst: PathBuf, exclude_patterns: Vec<String>) -> Result<u64> {
    tokio::task::spawn_blocking(move || {
        let excluded = |name: &str| -> bool {
            exclude_patterns.iter().any(|p| {
                if let Some(suffix) = p.strip_prefix('*') {
                    name.ends_with(suffix)
                } else {
                    name == p
                }
            })
        };

        let mut copied = 0u64;
        let walker = WalkDir::new(&src).into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !excluded(&name)
        });

        for entry in walker {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(&src)
                .expect("walkdir stays under root");
            let target = dst.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
                copied += 1;
            }
        }
        Ok(copied)
    })
    .await?
}

/// True when the directory contains at least one non-hidden file outside
/// the exclude list.
pub async fn dir_has_files(path: PathBuf) -> Result<bool> {
    tokio::task::spawn_blocking(move || {
        if !path.exists() {
            return Ok(false);
        }
        for entry in walk(&path) {
            if entry.file_type().is_file() {
                let name = entry.file_name().to_string_lossy();
                if !name.starts_with('.') {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    })
    .await?
}

/// List files under `root`, exclude-aware, capped at `max_files`. Paths are
/// relative to `base` (which contains `root`).
pub async fn list_files(base: PathBuf, root: PathBuf, max_files: usize) -> Result<Vec<FileEntry>> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        if !root.exists() {
            return Ok(files);
        }
        for entry in walk(&root) {
            if files.len() >= max_files {
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if EXCLUDED_FILES.contains(&name.as_str()) {
                continue;
            }
            let rel = entry.path().strip_prefix(&base).unwrap_or(entry.path());
            files.push(FileEntry {
                name,
                path: rel.to_string_lossy().to_string(),
                kind: FileKind::File,
                size: entry.metadata().map(|m| m.len()).unwrap_or(0),
            });
        }
        Ok(files)
    })
    .await?
}

/// Find files whose *name* matches a glob pattern, capped at `max_results`.
pub async fn glob_files(
    base: PathBuf,
    root: PathBuf,
    pattern: String,
    max_results: usize,
) -> Result<Vec<FileEntry>> {
    let pattern = Pattern::new(&pattern).context("invalid glob pattern")?;
    tokio::task::spawn_blocking(move || {
        let mut matches = Vec::new();
        if !root.exists() {
            return Ok(matches);
        }
        for entry in walk(&root) {
            if matches.len() >= max_results {
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if pattern.matches(&name) {
                let rel = entry.path().strip_prefix(&base).unwrap_or(entry.path());
                matches.push(FileEntry {
                    name: name.to_string(),
                    path: rel.to_string_lossy().to_string(),
                    kind: FileKind::File,
                    size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                });
            }
        }
        Ok(matches)
    })
    .await?
}

/// Search file contents for a regex, restricted to names matching
/// `file_pattern`, capped at `max_results` hits.
pub async fn grep_files(
    base: PathBuf,
    root: PathBuf,
    pattern: String,
    file_pattern: String,
    case_sensitive: bool,
    max_results: usize,
) -> Result<Vec<GrepMatch>> {
    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .context("invalid search pattern")?;
    let file_pattern = Pattern::new(&file_pattern).context("invalid file pattern")?;

    tokio::task::spawn_blocking(move || {
        let mut matches = Vec::new();
        if !root.exists() {
            return Ok(matches);
        }
        'files: for entry in walk(&root) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !file_pattern.matches(&name) || is_binary_name(&name) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let rel = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    let mut snippet = line.trim().to_string();
                    snippet.truncate(200);
                    matches.push(GrepMatch {
                        file: rel.clone(),
                        line: (idx + 1) as u64,
                        content: snippet,
                    });
                    if matches.len() >= max_results {
                        break 'files;
                    }
                }
            }
        }
        Ok(matches)
    })
    .await?
}

/// Bounded bulk read of text files with content (editor bootstrap).
pub async fn files_with_content(
    root: PathBuf,
    max_files: usize,
    max_file_size: u64,
) -> Result<Vec<(String, String)>> {
    tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        if !root.exists() {
            return Ok(out);
        }
        for entry in walk(&root) {
            if out.len() >= max_files {
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if EXCLUDED_FILES.contains(&name.as_ref()) || is_binary_name(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() > max_file_size {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            out.push((rel, content));
        }
        Ok(out)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        fs::write(dir.path().join("package.json"), "{\"name\":\"x\"}").unwrap();
        fs::write(dir.path().join("src/main.ts"), "const port = 5173;\n").unwrap();
        fs::write(dir.path().join("node_modules/react/index.js"), "x").unwrap();
        fs::write(dir.path().join("logo.png"), [0u8, 1, 2]).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_list_files_skips_excluded_dirs() {
        let dir = fixture();
        let files = list_files(dir.path().to_path_buf(), dir.path().to_path_buf(), 100)
            .await
            .unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"package.json"));
        assert!(paths.contains(&"src/main.ts"));
        assert!(!paths.iter().any(|p| p.contains("node_modules")));
    }

    #[tokio::test]
    async fn test_glob_and_grep() {
        let dir = fixture();
        let base = dir.path().to_path_buf();

        let hits = glob_files(base.clone(), base.clone(), "*.ts".to_string(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/main.ts");

        let matches = grep_files(
            base.clone(),
            base,
            "port".to_string(),
            "*".to_string(),
            true,
            10,
        )
        .await
        .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].line, 1);
        assert!(matches[0].content.contains("5173"));
    }

    #[tokio::test]
    async fn test_copy_tree_respects_excludes() {
        let dir = fixture();
        let dst = tempfile::tempdir().unwrap();

        let copied = copy_tree(
            dir.path().to_path_buf(),
            dst.path().to_path_buf(),
            vec!["node_modules".to_string(), "*.png".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(copied, 2); // package.json + src/main.ts
        assert!(dst.path().join("src/main.ts").exists());
        assert!(!dst.path().join("node_modules").exists());
        assert!(!dst.path().join("logo.png").exists());
    }

    #[tokio::test]
    async fn test_files_with_content_skips_binaries() {
        let dir = fixture();
        let files = files_with_content(dir.path().to_path_buf(), 100, 100_000)
            .await
            .unwrap();
        assert!(files.iter().any(|(p, _)| p == "package.json"));
        assert!(!files.iter().any(|(p, _)| p == "logo.png"));
    }

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_to_string(dir.path().join("nope.txt")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_dir_has_files() {
        let dir = fixture();
        assert!(dir_has_files(dir.path().to_path_buf()).await.unwrap());

        let empty = tempfile::tempdir().unwrap();
        assert!(!dir_has_files(empty.path().to_path_buf()).await.unwrap());
    }
}
