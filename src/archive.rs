//! Project directory <-> zip archive conversion
//!
//! Hibernation serializes a project directory into a single deflate zip;
//! restoration extracts it back. Dependency trees can be excluded to keep
//! uploads small (they are rebuilt by the startup command); VCS metadata
//! and caches are always excluded.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Directory names always left out of archives.
const ALWAYS_EXCLUDED_DIRS: &[&str] = &[".git", "__pycache__", ".next"];

/// File suffixes always left out of archives.
const EXCLUDED_SUFFIXES: &[&str] = &[".pyc", ".log"];

/// File names always left out of archives.
const EXCLUDED_NAMES: &[&str] = &[".DS_Store"];

fn keep_dir(name: &str, exclude_node_modules: bool) -> bool {
    if ALWAYS_EXCLUDED_DIRS.contains(&name) {
        return false;
    }
    !(exclude_node_modules && name == "node_modules")
}

fn keep_file(name: &str) -> bool {
    !EXCLUDED_NAMES.contains(&name) && !EXCLUDED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn compress_blocking(source: &Path, output: &Path, exclude_node_modules: bool) -> Result<u64> {
    let file = File::create(output)
        .with_context(|| format!("failed to create archive {}", output.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = 0u64;
    let walker = WalkDir::new(source).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !e.file_type().is_dir() || keep_dir(&name, exclude_node_modules)
    });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !keep_file(&name) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir stays under source");
        let arcname = rel.to_string_lossy().replace('\\', "/");

        writer.start_file(arcname, options)?;
        let mut input = File::open(entry.path())
            .with_context(|| format!("failed to open {}", entry.path().display()))?;
        io::copy(&mut input, &mut writer)?;
        entries += 1;
    }

    writer.finish()?;
    Ok(entries)
}

fn extract_blocking(archive_path: &Path, dest: &Path) -> Result<u64> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open archive {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file).context("invalid zip archive")?;
    std::fs::create_dir_all(dest)?;
    let count = archive.len() as u64;
    archive
        .extract(dest)
        .with_context(|| format!("failed to extract into {}", dest.display()))?;
    Ok(count)
}

/// Compress `source` into a zip at `output`. Returns the entry count.
pub async fn compress_dir(
    source: PathBuf,
    output: PathBuf,
    exclude_node_modules: bool,
) -> Result<u64> {
    tokio::task::spawn_blocking(move || compress_blocking(&source, &output, exclude_node_modules))
        .await?
}

/// Extract a zip archive into `dest`. Returns the entry count.
pub async fn extract_zip(archive_path: PathBuf, dest: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || extract_blocking(&archive_path, &dest)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_archive_round_trip_with_excludes() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("src")).unwrap();
        fs::create_dir_all(src.path().join("node_modules/left-pad")).unwrap();
        fs::create_dir_all(src.path().join(".git")).unwrap();
        fs::write(src.path().join("package.json"), "{}").unwrap();
        fs::write(src.path().join("src/app.ts"), "export {}\n").unwrap();
        fs::write(src.path().join("src/app.pyc"), "x").unwrap();
        fs::write(src.path().join("node_modules/left-pad/index.js"), "x").unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref").unwrap();

        let spool = tempfile::tempdir().unwrap();
        let zip_path = spool.path().join("out.zip");
        let entries = compress_dir(src.path().to_path_buf(), zip_path.clone(), true)
            .await
            .unwrap();
        assert_eq!(entries, 2); // package.json + src/app.ts

        let dest = tempfile::tempdir().unwrap();
        extract_zip(zip_path, dest.path().to_path_buf())
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(dest.path().join("src/app.ts")).unwrap(),
            "export {}\n"
        );
        assert!(!dest.path().join("node_modules").exists());
        assert!(!dest.path().join(".git").exists());
        assert!(!dest.path().join("src/app.pyc").exists());
    }

    #[tokio::test]
    async fn test_node_modules_kept_when_not_excluded() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("node_modules")).unwrap();
        fs::write(src.path().join("node_modules/a.js"), "x").unwrap();
        fs::write(src.path().join("index.js"), "x").unwrap();

        let spool = tempfile::tempdir().unwrap();
        let zip_path = spool.path().join("out.zip");
        let entries = compress_dir(src.path().to_path_buf(), zip_path, false)
            .await
            .unwrap();
        assert_eq!(entries, 2);
    }
}
