//! Filesystem cleanup for finished sessions and the administrative wipe.

use std::io;
use std::path::Path;

use serde::Serialize;

use crate::registry::StreamRegistry;
use crate::supervisor::StopMode;

/// What `reap_all` removed, returned to the caller for reporting.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ReapReport {
    pub stopped_streams: usize,
    pub removed_files: usize,
    pub removed_dirs: usize,
}

/// Delete the filesystem artifacts of one session: the output directory
/// recursively, and the input file best-effort. Failures are logged and
/// swallowed so teardown always completes.
pub async fn reap_session(output_path: &Path, input_path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(output_path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(
                path = %output_path.display(),
                "failed to remove output directory: {}", e
            );
        }
    }
    if let Err(e) = tokio::fs::remove_file(input_path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %input_path.display(), "failed to remove input: {}", e);
        }
    }
}

/// Administrative wipe. Forcefully stops every registered session (no grace
/// period), then removes every file directly under the upload staging area
/// and every directory directly under the output root - tracked or not.
pub async fn reap_all(
    registry: &StreamRegistry,
    upload_dir: &Path,
    output_dir: &Path,
) -> ReapReport {
    let stopped = registry.stop_all(StopMode::Forced).await;
    let mut report = ReapReport {
        stopped_streams: stopped.len(),
        ..ReapReport::default()
    };

    if let Ok(mut entries) = tokio::fs::read_dir(upload_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => report.removed_files += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), "cleanup skip: {}", e)
                }
            }
        }
    }

    if let Ok(mut entries) = tokio::fs::read_dir(output_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => report.removed_dirs += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), "cleanup skip: {}", e)
                }
            }
        }
    }

    tracing::info!(
        "cleanup done: {} stream(s) stopped, {} file(s), {} dir(s) removed",
        report.stopped_streams,
        report.removed_files,
        report.removed_dirs
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reap_session_removes_output_tree_and_input() {
        let dir = tempdir().expect("tempdir");
        let out = dir.path().join("demo_1");
        std::fs::create_dir_all(&out).expect("mkdir");
        std::fs::write(out.join("index.m3u8"), "#EXTM3U\n").expect("playlist");
        std::fs::write(out.join("segment_00000.ts"), [0u8; 8]).expect("segment");
        let input = dir.path().join("demo.mp4");
        std::fs::write(&input, [0u8; 8]).expect("input");

        reap_session(&out, &input).await;

        assert!(!out.exists());
        assert!(!input.exists());
    }

    #[tokio::test]
    async fn reap_session_tolerates_missing_artifacts() {
        let dir = tempdir().expect("tempdir");
        // Nothing exists; both removals are no-ops.
        reap_session(&dir.path().join("gone"), &dir.path().join("gone.mp4")).await;
    }

    #[tokio::test]
    async fn reap_all_sweeps_untracked_artifacts() {
        let uploads = tempdir().expect("uploads");
        let output = tempdir().expect("output");

        std::fs::write(uploads.path().join("stale1.mp4"), [0u8; 4]).expect("file");
        std::fs::write(uploads.path().join("stale2.mp4"), [0u8; 4]).expect("file");
        // Subdirectories in the staging area are left alone.
        std::fs::create_dir(uploads.path().join("keep_dir")).expect("dir");

        std::fs::create_dir(output.path().join("orphan_1")).expect("dir");
        std::fs::write(output.path().join("orphan_1/index.m3u8"), "#EXTM3U\n").expect("file");
        // Loose files in the output root are left alone.
        std::fs::write(output.path().join("keep.txt"), "x").expect("file");

        let registry = StreamRegistry::new(4);
        let report = reap_all(&registry, uploads.path(), output.path()).await;

        assert_eq!(report.stopped_streams, 0);
        assert_eq!(report.removed_files, 2);
        assert_eq!(report.removed_dirs, 1);
        assert!(uploads.path().join("keep_dir").exists());
        assert!(output.path().join("keep.txt").exists());
    }
}
