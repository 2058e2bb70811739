//! Forced file deletion.
//!
//! A just-recorded file is often still held open by another process (the
//! encoder itself, an antivirus scanner, a media player). Plain removal is
//! tried first; on a busy/permission failure the holder processes are
//! discovered and killed, and as a last resort the platform's forced-delete
//! command is invoked. At most three attempts; exhausting them is reported,
//! never escalated into a crash.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;

/// After killing a holder the OS needs a moment to release the handle.
const HOLDER_RELEASE_PAUSE: Duration = Duration::from_secs(1);

const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// OS error codes meaning "another process holds this file".
/// ERROR_SHARING_VIOLATION and ERROR_LOCK_VIOLATION on Windows.
#[cfg(windows)]
const LOCKED_OS_ERRORS: [i32; 2] = [32, 33];
/// EBUSY and ETXTBSY elsewhere.
#[cfg(not(windows))]
const LOCKED_OS_ERRORS: [i32; 2] = [16, 26];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Failed,
}

impl DeleteOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted)
    }
}

/// A process found holding the target file open.
#[derive(Debug, Clone)]
pub struct HolderProcess {
    pub pid: u32,
    pub name: String,
}

/// The per-OS surface of the deleter: file removal, open-handle discovery,
/// process termination and the shell fallback. Everything above this trait
/// is platform-independent.
pub trait Platform: Send + Sync {
    fn remove_file(&self, path: &Path) -> std::io::Result<()>;

    /// All running processes with an open handle to `path`.
    fn holders(&self, path: &Path) -> Vec<HolderProcess>;

    /// Terminate one holder. Returns whether the kill was delivered.
    fn kill(&self, holder: &HolderProcess) -> bool;

    /// Last-resort forced removal.
    fn force_remove(&self, path: &Path) -> bool;
}

pub struct SystemPlatform;

impl Platform for SystemPlatform {
    fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }

    #[cfg(unix)]
    fn holders(&self, path: &Path) -> Vec<HolderProcess> {
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let own_pid = std::process::id();
        let mut found = Vec::new();

        let proc_root = match std::fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot enumerate processes: {}", e);
                return found;
            }
        };

        for entry in proc_root.filter_map(|e| e.ok()) {
            let pid: u32 = match entry.file_name().to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue, // not a process directory
            };
            // Never kill ourselves.
            if pid == own_pid {
                continue;
            }

            let fds = match std::fs::read_dir(entry.path().join("fd")) {
                Ok(fds) => fds,
                Err(_) => continue, // gone, or not ours to inspect
            };

            let holds_target = fds
                .filter_map(|fd| fd.ok())
                .filter_map(|fd| std::fs::read_link(fd.path()).ok())
                .any(|link| link == target);

            if holds_target {
                let name = std::fs::read_to_string(entry.path().join("comm"))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| format!("pid {}", pid));
                found.push(HolderProcess { pid, name });
            }
        }

        found
    }

    #[cfg(not(unix))]
    fn holders(&self, _path: &Path) -> Vec<HolderProcess> {
        // Open-handle enumeration needs the Restart Manager API; without it
        // the ladder goes straight to the forced-delete command.
        log::debug!("Holder enumeration not available on this platform");
        Vec::new()
    }

    #[cfg(unix)]
    fn kill(&self, holder: &HolderProcess) -> bool {
        Command::new("kill")
            .args(["-9", &holder.pid.to_string()])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    fn kill(&self, holder: &HolderProcess) -> bool {
        Command::new("taskkill")
            .args(["/F", "/PID", &holder.pid.to_string()])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn force_remove(&self, path: &Path) -> bool {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.args(["/c", "del", "/f", "/q"]).arg(path);
            cmd
        } else {
            let mut cmd = Command::new("rm");
            cmd.arg("-f").arg(path);
            cmd
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("Force delete spawn failed: {}", e);
                return false;
            }
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    log::info!("Force deleted via shell: {}", path.display());
                    return true;
                }
                Ok(Some(status)) => {
                    log::error!("Force delete command exited with {}", status);
                    return false;
                }
                Ok(None) => {
                    if std::time::Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        log::error!("Force delete command timed out");
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    log::error!("Force delete wait failed: {}", e);
                    return false;
                }
            }
        }
    }
}

/// Busy/permission errors trigger holder discovery; anything else is just a
/// failed attempt.
fn is_locked_error(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        return true;
    }
    e.raw_os_error()
        .map(|code| LOCKED_OS_ERRORS.contains(&code))
        .unwrap_or(false)
}

pub struct ForcedDeleter {
    platform: Arc<dyn Platform>,
}

impl Default for ForcedDeleter {
    fn default() -> Self {
        Self::new()
    }
}

impl ForcedDeleter {
    pub fn new() -> Self {
        Self::with_platform(Arc::new(SystemPlatform))
    }

    pub fn with_platform(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Delete `path`, escalating through the ladder. Idempotent: a path
    /// that does not exist is already deleted.
    ///
    /// Every `Platform` call runs on the blocking pool; holder scans and
    /// the forced-delete command can take seconds.
    pub async fn delete(&self, path: &Path) -> DeleteOutcome {
        for attempt in 1..=MAX_ATTEMPTS {
            let removed = {
                let platform = self.platform.clone();
                let target = path.to_path_buf();
                tokio::task::spawn_blocking(move || platform.remove_file(&target)).await
            };
            let removed = match removed {
                Ok(result) => result,
                Err(e) => {
                    log::error!("Delete task failed: {}", e);
                    return DeleteOutcome::Failed;
                }
            };

            match removed {
                Ok(()) => {
                    log::info!("Deleted: {}", path.display());
                    return DeleteOutcome::Deleted;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::debug!("File already gone: {}", path.display());
                    return DeleteOutcome::Deleted;
                }
                Err(e) if is_locked_error(&e) => {
                    log::warn!(
                        "Attempt {}/{}: file is locked: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        e
                    );
                    if attempt < MAX_ATTEMPTS {
                        if self.kill_holders(path).await > 0 {
                            tokio::time::sleep(HOLDER_RELEASE_PAUSE).await;
                        } else {
                            log::warn!("No processes found holding the file");
                        }
                    } else if self.force_remove(path).await {
                        return DeleteOutcome::Deleted;
                    }
                }
                Err(e) => {
                    log::error!(
                        "Attempt {}/{}: unexpected delete error: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        e
                    );
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
            }
        }

        log::error!(
            "Failed to delete after {} attempts: {}",
            MAX_ATTEMPTS,
            path.display()
        );
        DeleteOutcome::Failed
    }

    async fn kill_holders(&self, path: &Path) -> usize {
        let platform = self.platform.clone();
        let target = path.to_path_buf();
        let killed = tokio::task::spawn_blocking(move || {
            let holders = platform.holders(&target);
            let mut killed = 0;
            for holder in &holders {
                log::warn!(
                    "Killing holder process: {} (pid {})",
                    holder.name,
                    holder.pid
                );
                if platform.kill(holder) {
                    killed += 1;
                } else {
                    log::warn!("Could not kill {} (pid {})", holder.name, holder.pid);
                }
            }
            killed
        })
        .await;

        killed.unwrap_or_else(|e| {
            log::error!("Holder kill task failed: {}", e);
            0
        })
    }

    async fn force_remove(&self, path: &Path) -> bool {
        let platform = self.platform.clone();
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || platform.force_remove(&target))
            .await
            .unwrap_or_else(|e| {
                log::error!("Force delete task failed: {}", e);
                false
            })
    }

    /// Force-delete every WAV left in `folder`, e.g. after a crash left
    /// files behind. Returns (deleted, failed) counts.
    pub async fn cleanup_folder(&self, folder: &Path) -> (usize, usize) {
        let entries = match std::fs::read_dir(folder) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot read folder {}: {}", folder.display(), e);
                return (0, 0);
            }
        };

        let wavs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("wav"))
                    .unwrap_or(false)
            })
            .collect();

        let mut deleted = 0;
        let mut failed = 0;
        for path in &wavs {
            if self.delete(path).await.is_deleted() {
                deleted += 1;
            } else {
                failed += 1;
            }
        }
        log::info!(
            "Folder cleanup: {} deleted, {} failed in {}",
            deleted,
            failed,
            folder.display()
        );
        (deleted, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn deleting_a_missing_path_is_already_deleted() {
        let deleter = ForcedDeleter::new();
        let path = Path::new("/tmp/never_existed_meeting_recorder_42.wav");
        assert!(deleter.delete(path).await.is_deleted());
        // Idempotent: second call succeeds too.
        assert!(deleter.delete(path).await.is_deleted());
    }

    #[tokio::test]
    async fn plain_removal_succeeds_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("recording_20240101_120000.wav");
        std::fs::write(&file, b"data").unwrap();

        let deleter = ForcedDeleter::new();
        assert!(deleter.delete(&file).await.is_deleted());
        assert!(!file.exists());
    }

    /// Platform where the file stays locked until the single holder is
    /// killed, standing in for an encoder that still has the handle open.
    struct LockedUntilKilled {
        locked: AtomicBool,
        kills: AtomicUsize,
    }

    impl Platform for LockedUntilKilled {
        fn remove_file(&self, path: &Path) -> std::io::Result<()> {
            if self.locked.load(Ordering::SeqCst) {
                Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            } else {
                std::fs::remove_file(path)
            }
        }
        fn holders(&self, _path: &Path) -> Vec<HolderProcess> {
            vec![HolderProcess {
                pid: 99999,
                name: "stuck-encoder".to_string(),
            }]
        }
        fn kill(&self, _holder: &HolderProcess) -> bool {
            self.locked.store(false, Ordering::SeqCst);
            self.kills.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn force_remove(&self, _path: &Path) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn locked_file_is_freed_by_killing_the_holder() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("recording_20240101_120000.wav");
        std::fs::write(&file, b"data").unwrap();

        let platform = Arc::new(LockedUntilKilled {
            locked: AtomicBool::new(true),
            kills: AtomicUsize::new(0),
        });
        let deleter = ForcedDeleter::with_platform(platform.clone());

        // Attempt 1 fails locked, the holder is killed, attempt 2 succeeds.
        let outcome = deleter.delete(&file).await;
        assert!(outcome.is_deleted());
        assert_eq!(platform.kills.load(Ordering::SeqCst), 1);
        assert!(!file.exists());
    }

    /// Platform that never lets go: every rung of the ladder fails.
    struct AlwaysLocked {
        /// Raw OS error to fail removal with; None means PermissionDenied.
        raw_os_error: Option<i32>,
        holder_scans: AtomicUsize,
        force_attempts: AtomicUsize,
    }

    impl Platform for AlwaysLocked {
        fn remove_file(&self, _path: &Path) -> std::io::Result<()> {
            match self.raw_os_error {
                Some(code) => Err(std::io::Error::from_raw_os_error(code)),
                None => Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
            }
        }
        fn holders(&self, _path: &Path) -> Vec<HolderProcess> {
            self.holder_scans.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
        fn kill(&self, _holder: &HolderProcess) -> bool {
            false
        }
        fn force_remove(&self, _path: &Path) -> bool {
            self.force_attempts.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_ladder_reports_failed_within_three_attempts() {
        let platform = Arc::new(AlwaysLocked {
            raw_os_error: None,
            holder_scans: AtomicUsize::new(0),
            force_attempts: AtomicUsize::new(0),
        });
        let deleter = ForcedDeleter::with_platform(platform.clone());

        let outcome = deleter.delete(Path::new("/tmp/held_forever.wav")).await;
        assert_eq!(outcome, DeleteOutcome::Failed);
        // Holder discovery runs on attempts 1 and 2; attempt 3 goes to the
        // forced-delete command instead.
        assert_eq!(platform.holder_scans.load(Ordering::SeqCst), 2);
        assert_eq!(platform.force_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn os_sharing_violation_engages_the_ladder() {
        // The raw code the OS reports for a file held open by another
        // process (ERROR_SHARING_VIOLATION on Windows, EBUSY elsewhere)
        // must be treated as locked, not as an unexpected error.
        let platform = Arc::new(AlwaysLocked {
            raw_os_error: Some(LOCKED_OS_ERRORS[0]),
            holder_scans: AtomicUsize::new(0),
            force_attempts: AtomicUsize::new(0),
        });
        let deleter = ForcedDeleter::with_platform(platform.clone());

        let outcome = deleter.delete(Path::new("/tmp/held_by_player.wav")).await;
        assert_eq!(outcome, DeleteOutcome::Failed);
        assert_eq!(platform.holder_scans.load(Ordering::SeqCst), 2);
        assert_eq!(platform.force_attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_platform_lock_code_is_recognized() {
        for code in LOCKED_OS_ERRORS {
            let err = std::io::Error::from_raw_os_error(code);
            assert!(is_locked_error(&err), "code {} must count as locked", code);
        }
        assert!(!is_locked_error(&std::io::Error::from(
            std::io::ErrorKind::NotFound
        )));
    }

    #[tokio::test]
    async fn cleanup_folder_removes_only_wavs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("b.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.mp3"), b"x").unwrap();

        let deleter = ForcedDeleter::new();
        let (deleted, failed) = deleter.cleanup_folder(dir.path()).await;
        assert_eq!(deleted, 2);
        assert_eq!(failed, 0);
        assert!(dir.path().join("keep.mp3").exists());
    }
}
