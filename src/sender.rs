//! Batch delivery of audio files left in the watch folder.
//!
//! Recordings survive on disk whenever delivery failed (webhook down, bad
//! credentials) or the process died mid-pipeline. This sender scans the
//! folder and replays them through the same uploader, oldest first.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::delete::ForcedDeleter;
use crate::upload::{UploadMetadata, WebhookUploader};

const SUPPORTED_AUDIO_EXTENSIONS: [&str; 7] =
    ["wav", "mp3", "m4a", "aac", "flac", "ogg", "wma"];

#[derive(Debug)]
pub enum SenderError {
    FolderMissing(PathBuf),
    NotAFolder(PathBuf),
}

impl std::fmt::Display for SenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderError::FolderMissing(p) => {
                write!(f, "target folder does not exist: {}", p.display())
            }
            SenderError::NotAFolder(p) => {
                write!(f, "target path is not a directory: {}", p.display())
            }
        }
    }
}

impl std::error::Error for SenderError {}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Include subdirectories.
    pub recursive: bool,
    /// Delete each file after its upload succeeds.
    pub delete_after_upload: bool,
    /// Pause between uploads so the receiving workflow is not flooded.
    pub delay_between_uploads: Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn all_successful(&self) -> bool {
        self.failed == 0
    }
}

pub struct BatchSender {
    folder: PathBuf,
    uploader: Arc<WebhookUploader>,
    deleter: Arc<ForcedDeleter>,
}

impl BatchSender {
    pub fn new(
        folder: PathBuf,
        uploader: Arc<WebhookUploader>,
        deleter: Arc<ForcedDeleter>,
    ) -> Result<Self, SenderError> {
        if !folder.exists() {
            return Err(SenderError::FolderMissing(folder));
        }
        if !folder.is_dir() {
            return Err(SenderError::NotAFolder(folder));
        }
        Ok(Self {
            folder,
            uploader,
            deleter,
        })
    }

    /// All audio files under the folder, oldest first so replayed
    /// recordings arrive in the order they were made.
    pub fn find_audio_files(&self, recursive: bool) -> Vec<PathBuf> {
        let mut files = Vec::new();
        collect_audio_files(&self.folder, recursive, &mut files);
        files.sort_by_key(|path| {
            std::fs::metadata(path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        });
        files
    }

    /// Upload every audio file in the folder. Failures are counted, not
    /// fatal: the remaining files still get their turn.
    pub async fn send_all(&self, options: SendOptions) -> BatchReport {
        let files = self.find_audio_files(options.recursive);

        if files.is_empty() {
            log::info!("No audio files found in {}", self.folder.display());
            return BatchReport::default();
        }

        log::info!(
            "Found {} audio file(s) in {}",
            files.len(),
            self.folder.display()
        );

        let mut report = BatchReport {
            total: files.len(),
            ..Default::default()
        };

        for (index, path) in files.iter().enumerate() {
            log::info!("Progress: {}/{}", index + 1, files.len());

            if self.send_one(path, options.delete_after_upload).await {
                report.successful += 1;
            } else {
                report.failed += 1;
            }

            if !options.delay_between_uploads.is_zero() && index + 1 < files.len() {
                tokio::time::sleep(options.delay_between_uploads).await;
            }
        }

        log::info!(
            "Batch send complete: {} successful, {} failed, {} total",
            report.successful,
            report.failed,
            report.total
        );
        report
    }

    async fn send_one(&self, path: &Path, delete_after_upload: bool) -> bool {
        let metadata = match UploadMetadata::for_file(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::error!("Cannot read {}: {}", path.display(), e);
                return false;
            }
        };

        if let Err(e) = self.uploader.upload(path, &metadata).await {
            log::error!("Failed to send {}: {}", path.display(), e);
            return false;
        }

        if delete_after_upload && !self.deleter.delete(path).await.is_deleted() {
            // Sent but not cleaned up: warn, the send still counts.
            log::warn!("Sent but could not delete: {}", path.display());
        }

        true
    }
}

fn collect_audio_files(folder: &Path, recursive: bool, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot read {}: {}", folder.display(), e);
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                collect_audio_files(&path, recursive, out);
            }
        } else if is_audio_file(&path) {
            out.push(path);
        }
    }
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            SUPPORTED_AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn test_sender(folder: PathBuf) -> BatchSender {
        let uploader = Arc::new(WebhookUploader::new(
            "http://127.0.0.1:9/never-reached",
            Credentials::default(),
        ));
        BatchSender::new(folder, uploader, Arc::new(ForcedDeleter::new())).unwrap()
    }

    #[test]
    fn missing_folder_is_rejected() {
        let uploader = Arc::new(WebhookUploader::new(
            "http://127.0.0.1:9/never-reached",
            Credentials::default(),
        ));
        let result = BatchSender::new(
            PathBuf::from("/tmp/no_such_folder_ever_12345"),
            uploader,
            Arc::new(ForcedDeleter::new()),
        );
        assert!(matches!(result, Err(SenderError::FolderMissing(_))));
    }

    #[test]
    fn only_audio_extensions_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("b.MP3"), b"x").unwrap();
        std::fs::write(dir.path().join("c.flac"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("noext"), b"x").unwrap();

        let sender = test_sender(dir.path().to_path_buf());
        let files = sender.find_audio_files(false);
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn subdirectories_require_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("top.wav"), b"x").unwrap();
        let sub = dir.path().join("old");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("nested.wav"), b"x").unwrap();

        let sender = test_sender(dir.path().to_path_buf());
        assert_eq!(sender.find_audio_files(false).len(), 1);
        assert_eq!(sender.find_audio_files(true).len(), 2);
    }

    #[test]
    fn files_come_back_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("older.wav");
        let newer = dir.path().join("newer.wav");
        std::fs::write(&older, b"x").unwrap();
        std::fs::write(&newer, b"x").unwrap();

        // Push the second file's mtime into the future so ordering does not
        // depend on filesystem timestamp resolution.
        let future = std::time::SystemTime::now() + Duration::from_secs(60);
        let file = std::fs::OpenOptions::new().write(true).open(&newer).unwrap();
        file.set_modified(future).unwrap();

        let sender = test_sender(dir.path().to_path_buf());
        let files = sender.find_audio_files(false);
        assert_eq!(files, vec![older, newer]);
    }

    #[tokio::test]
    async fn empty_folder_reports_zero_totals() {
        let dir = tempfile::tempdir().unwrap();
        let sender = test_sender(dir.path().to_path_buf());
        let report = sender.send_all(SendOptions::default()).await;
        assert_eq!(report, BatchReport::default());
        assert!(report.all_successful());
    }
}
