// Download-only mode: enumerate an album and save its files to a local
// directory instead of uploading them. No state store, no recovery.

use crate::agent::{Catalog, EnumerateError};
use crate::source::SourceFetcher;
use crate::transfer::{SourceFile, UploadFailure};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Failed to enumerate album: {0}")]
    Enumerate(#[from] EnumerateError),
    #[error("Album has no files to download")]
    NoFiles,
    #[error("Failed to create {path}: {source}")]
    TargetDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub saved: Vec<PathBuf>,
    pub failures: Vec<UploadFailure>,
}

/// Saves album files from the source site to disk
pub struct DownloadService;

impl DownloadService {
    /// Download the first `count` files of an album into `target_dir`.
    ///
    /// Files sharing a source URL are fetched once. A file that fails to
    /// fetch or write is reported and does not stop the others.
    pub async fn download_album(
        catalog: &dyn Catalog,
        fetcher: &dyn SourceFetcher,
        album_id: &str,
        count: usize,
        target_dir: &Path,
        concurrency: usize,
    ) -> Result<DownloadReport, DownloadError> {
        let files = unique_by_url(catalog.enumerate_files(album_id).await?, count);
        if files.is_empty() {
            return Err(DownloadError::NoFiles);
        }

        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| DownloadError::TargetDir {
                path: target_dir.to_path_buf(),
                source,
            })?;

        info!(
            "Downloading {} files of album {} to {}",
            files.len(),
            album_id,
            target_dir.display()
        );

        let results: Vec<Result<PathBuf, UploadFailure>> = stream::iter(files)
            .map(|file| async move { save_file(fetcher, &file, target_dir).await })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = DownloadReport {
            saved: Vec::new(),
            failures: Vec::new(),
        };
        for result in results {
            match result {
                Ok(path) => report.saved.push(path),
                Err(failure) => {
                    warn!("Failed to download {}: {}", failure.filename, failure.error);
                    report.failures.push(failure);
                }
            }
        }
        report.saved.sort();

        info!(
            "Downloaded {} files, {} failed",
            report.saved.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

fn unique_by_url(files: Vec<SourceFile>, count: usize) -> Vec<SourceFile> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .take(count)
        .filter(|f| seen.insert(f.source_url.clone()))
        .collect()
}

async fn save_file(
    fetcher: &dyn SourceFetcher,
    file: &SourceFile,
    target_dir: &Path,
) -> Result<PathBuf, UploadFailure> {
    let failure = |error: String| UploadFailure {
        filename: file.filename.clone(),
        error,
    };

    // Never let a source filename escape the target directory
    let name = Path::new(&file.filename)
        .file_name()
        .ok_or_else(|| failure("invalid filename".to_string()))?;
    let path = target_dir.join(name);

    let data = fetcher
        .fetch(&file.source_url)
        .await
        .map_err(|e| failure(e.to_string()))?;
    tokio::fs::write(&path, &data)
        .await
        .map_err(|e| failure(format!("write failed: {}", e)))?;

    debug!("Saved {} ({} bytes)", path.display(), data.len());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{source_file, source_files, source_url, MockCatalog, MockFetcher};
    use crate::transfer::TransferError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_download_saves_first_files() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("album-42");
        let catalog = MockCatalog::new();
        catalog.add_album("42", "Garden Party", source_files("g", 5));
        let fetcher = MockFetcher::new();

        let report = DownloadService::download_album(&catalog, &fetcher, "42", 3, &target, 2)
            .await
            .unwrap();

        assert_eq!(report.saved.len(), 3);
        assert!(report.failures.is_empty());
        assert_eq!(fetcher.fetch_count(), 3);

        let saved = std::fs::read(target.join("g-001.jpg")).unwrap();
        assert_eq!(saved, source_url("g-001.jpg").into_bytes());
        assert!(!target.join("g-003.jpg").exists());
    }

    #[tokio::test]
    async fn test_duplicate_urls_are_fetched_once() {
        let temp_dir = TempDir::new().unwrap();
        let mut files = source_files("d", 2);
        let mut duplicate = source_file("d-000.jpg");
        duplicate.file_id = "id-copy".to_string();
        files.insert(1, duplicate);

        let catalog = MockCatalog::new();
        catalog.add_album("7", "Harbour", files);
        let fetcher = MockFetcher::new();

        let report =
            DownloadService::download_album(&catalog, &fetcher, "7", 10, temp_dir.path(), 4)
                .await
                .unwrap();

        assert_eq!(report.saved.len(), 2);
        assert_eq!(fetcher.fetches_of("d-000.jpg"), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_does_not_stop_others() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = MockCatalog::new();
        catalog.add_album("9", "Studio", source_files("s", 3));
        let fetcher = MockFetcher::new();
        fetcher.script(
            "s-001.jpg",
            vec![TransferError::Blocked("HTTP 403".to_string())],
        );

        let report =
            DownloadService::download_album(&catalog, &fetcher, "9", 3, temp_dir.path(), 1)
                .await
                .unwrap();

        assert_eq!(report.saved.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].filename, "s-001.jpg");
        assert!(!temp_dir.path().join("s-001.jpg").exists());
    }

    #[tokio::test]
    async fn test_empty_album_and_enumeration_errors() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = MockCatalog::new();
        catalog.add_album("1", "Empty", Vec::new());
        catalog.add_album("2", "Blocked", source_files("b", 2));
        catalog.script_enumeration("2", vec![EnumerateError::MetadataEmpty]);
        let fetcher = MockFetcher::new();

        let empty =
            DownloadService::download_album(&catalog, &fetcher, "1", 5, temp_dir.path(), 2).await;
        assert!(matches!(empty, Err(DownloadError::NoFiles)));

        let blocked =
            DownloadService::download_album(&catalog, &fetcher, "2", 5, temp_dir.path(), 2).await;
        assert!(matches!(
            blocked,
            Err(DownloadError::Enumerate(EnumerateError::MetadataEmpty))
        ));
        assert_eq!(fetcher.fetch_count(), 0);
    }
}
