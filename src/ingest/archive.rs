//! Path-traversal-safe archive extraction.
//!
//! Archives arrive from blob storage and are extracted into a scratch
//! directory that lives exactly as long as the job. Two guards apply to
//! every entry: the normalized destination must stay inside the extraction
//! root, and the running uncompressed total must stay under the configured
//! bound. Violating either refuses the archive as a whole.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::core::errors::{ArchrevError, Result};

/// Scratch directory holding one job's extracted tree.
///
/// Dropping the guard removes the directory; the job runner keeps it alive
/// for the duration of the pipeline and relies on drop for cleanup on every
/// exit path.
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Create an empty scratch directory.
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()
            .map_err(|e| ArchrevError::io("Cannot create scratch directory", e))?;
        Ok(Self { dir })
    }

    /// Root path of the scratch tree.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Outcome of a successful extraction.
#[derive(Debug)]
pub struct ExtractionSummary {
    /// Number of regular files written
    pub file_count: usize,
    /// Total uncompressed bytes written
    pub total_bytes: u64,
}

/// Extract `archive_bytes` into `dest`, refusing traversal and oversize.
///
/// Runs the synchronous zip walk on the blocking pool; the caller awaits the
/// result and observes its cancellation token between pipeline stages.
pub async fn extract_archive(
    archive_bytes: Vec<u8>,
    dest: PathBuf,
    max_uncompressed_bytes: u64,
) -> Result<ExtractionSummary> {
    let summary = tokio::task::spawn_blocking(move || {
        extract_sync(&archive_bytes, &dest, max_uncompressed_bytes)
    })
    .await
    .map_err(|e| ArchrevError::internal(format!("Extraction task panicked: {e}")))??;

    info!(
        files = summary.file_count,
        bytes = summary.total_bytes,
        "archive extracted"
    );
    Ok(summary)
}

fn extract_sync(
    archive_bytes: &[u8],
    dest: &Path,
    max_uncompressed_bytes: u64,
) -> Result<ExtractionSummary> {
    let reader = io::Cursor::new(archive_bytes);
    let mut archive = ZipArchive::new(reader).map_err(|e| {
        ArchrevError::validation("Project.InvalidZipFile", format!("Unreadable archive: {e}"))
    })?;

    if archive.is_empty() {
        return Err(ArchrevError::validation(
            "Project.NoFilesToAnalyze",
            "Archive contains no entries",
        ));
    }

    let mut file_count = 0usize;
    let mut total_bytes = 0u64;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| {
            ArchrevError::validation(
                "Project.InvalidZipFile",
                format!("Unreadable archive entry {index}: {e}"),
            )
        })?;

        // `enclosed_name` normalizes the entry path and rejects any name that
        // would escape the extraction root.
        let relative = entry.enclosed_name().ok_or_else(|| {
            ArchrevError::validation(
                "Project.InvalidZipFile",
                format!("Archive entry escapes extraction root: {}", entry.name()),
            )
        })?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| ArchrevError::io("Cannot create extracted directory", e))?;
            continue;
        }

        total_bytes = total_bytes.saturating_add(entry.size());
        if total_bytes > max_uncompressed_bytes {
            return Err(ArchrevError::validation(
                "Project.InvalidZipFile",
                format!(
                    "Uncompressed size exceeds the {max_uncompressed_bytes}-byte bound at entry {}",
                    entry.name()
                ),
            ));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ArchrevError::io("Cannot create extracted directory", e))?;
        }

        let mut out = fs::File::create(&target)
            .map_err(|e| ArchrevError::io("Cannot create extracted file", e))?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| ArchrevError::io("Cannot write extracted file", e))?;
        file_count += 1;
        debug!(path = %relative.display(), "extracted");
    }

    if file_count == 0 {
        return Err(ArchrevError::validation(
            "Project.NoFilesToAnalyze",
            "Archive contains no files",
        ));
    }

    Ok(ExtractionSummary {
        file_count,
        total_bytes,
    })
}

/// Read a file's content for chunking, capped defensively at the RAG bound.
pub fn read_text_lossy(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).map_err(|e| ArchrevError::io("Cannot open source file", e))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)
        .map_err(|e| ArchrevError::io("Cannot read source file", e))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            for (name, body) in entries {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn test_extracts_regular_entries() {
        let bytes = build_archive(&[
            ("src/main.rs", "fn main() {}\n"),
            ("README.md", "# demo\n"),
        ]);
        let scratch = ScratchDir::new().unwrap();
        let summary = extract_archive(bytes, scratch.path().to_path_buf(), 1024 * 1024)
            .await
            .unwrap();

        assert_eq!(summary.file_count, 2);
        assert!(scratch.path().join("src/main.rs").is_file());
        assert!(scratch.path().join("README.md").is_file());
    }

    #[tokio::test]
    async fn test_rejects_traversal_entries() {
        let bytes = build_archive(&[("../evil.sh", "rm -rf /\n")]);
        let scratch = ScratchDir::new().unwrap();
        let result = extract_archive(bytes, scratch.path().to_path_buf(), 1024 * 1024).await;

        let err = result.unwrap_err();
        assert_eq!(err.error_code(), "Project.InvalidZipFile");
        assert!(!scratch.path().parent().unwrap().join("evil.sh").exists());
    }

    #[tokio::test]
    async fn test_rejects_oversized_archives() {
        let big = "x".repeat(4096);
        let bytes = build_archive(&[("a.txt", &big), ("b.txt", &big)]);
        let scratch = ScratchDir::new().unwrap();
        let result = extract_archive(bytes, scratch.path().to_path_buf(), 5000).await;

        assert_eq!(result.unwrap_err().error_code(), "Project.InvalidZipFile");
    }

    #[tokio::test]
    async fn test_rejects_garbage_bytes() {
        let scratch = ScratchDir::new().unwrap();
        let result = extract_archive(
            b"not a zip".to_vec(),
            scratch.path().to_path_buf(),
            1024,
        )
        .await;
        assert_eq!(result.unwrap_err().error_code(), "Project.InvalidZipFile");
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let path;
        {
            let scratch = ScratchDir::new().unwrap();
            path = scratch.path().to_path_buf();
            assert!(path.is_dir());
        }
        assert!(!path.exists());
    }
}
