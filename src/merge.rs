//! Two-phase merge coordination.
//!
//! The first upload parks its file under a single-use merge token; the second
//! upload redeems the token, runs the external merge step synchronously, and
//! hands the merged file to the normal session launch path. Tokens are
//! consumed exactly once - by completion (successful or not) or by expiry.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::util;

#[derive(Debug)]
pub enum MergeError {
    /// Unknown, already consumed, or expired merge token
    InvalidMergeId,
    /// The external merge step exited nonzero
    Failed(String),
    /// The external merge step could not be run at all
    Io(io::Error),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::InvalidMergeId => write!(f, "invalid merge id"),
            MergeError::Failed(msg) => write!(f, "merge failed: {}", msg),
            MergeError::Io(e) => write!(f, "merge execution error: {}", e),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MergeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Runs the external "combine two inputs into one" step.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MergeExecutor: Send + Sync {
    async fn merge(&self, first: &Path, second: &Path, output: &Path) -> io::Result<Output>;
}

/// Real executor: ffmpeg concat with scale/pad to 720p and a re-encode, so
/// two arbitrary inputs end up with a single coherent stream.
pub struct FfmpegMerger;

#[async_trait]
impl MergeExecutor for FfmpegMerger {
    async fn merge(&self, first: &Path, second: &Path, output: &Path) -> io::Result<Output> {
        const FILTER: &str = "[0:v]scale=1280:720:force_original_aspect_ratio=decrease,\
             pad=1280:720:(ow-iw)/2:(oh-ih)/2,setsar=1[v0];\
             [1:v]scale=1280:720:force_original_aspect_ratio=decrease,\
             pad=1280:720:(ow-iw)/2:(oh-ih)/2,setsar=1[v1];\
             [v0][0:a][v1][1:a]concat=n=2:v=1:a=1[outv][outa]";

        Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(first)
            .arg("-i")
            .arg(second)
            .arg("-filter_complex")
            .arg(FILTER)
            .args(["-map", "[outv]", "-map", "[outa]"])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "23"])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-c:a", "aac", "-b:a", "128k"])
            .args(["-movflags", "+faststart"])
            .arg(output)
            .stdin(Stdio::null())
            .output()
            .await
    }
}

struct PendingMerge {
    first_input: PathBuf,
    created_at: Instant,
}

pub struct MergeCoordinator<E = FfmpegMerger> {
    pending: Mutex<HashMap<String, PendingMerge>>,
    ttl: Duration,
    executor: E,
}

impl MergeCoordinator<FfmpegMerger> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_executor(ttl, FfmpegMerger)
    }
}

impl<E: MergeExecutor> MergeCoordinator<E> {
    pub fn with_executor(ttl: Duration, executor: E) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
            executor,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingMerge>> {
        self.pending.lock().expect("pending merge lock poisoned")
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Park the first uploaded file and hand out a single-use token.
    pub fn begin_merge(&self, first_input: PathBuf) -> String {
        let merge_id = util::short_token();
        self.lock().insert(
            merge_id.clone(),
            PendingMerge {
                first_input,
                created_at: Instant::now(),
            },
        );
        tracing::info!(merge = %merge_id, "pending merge created");
        merge_id
    }

    /// Redeem a token and run the external merge into `merged_output`,
    /// blocking the caller (but no one else) until the step finishes.
    ///
    /// The token is consumed no matter how the attempt ends, and the staged
    /// raw inputs are deleted after the attempt regardless of outcome. A
    /// failed merge leaves no partial output file behind.
    pub async fn complete_merge(
        &self,
        merge_id: &str,
        second_input: &Path,
        merged_output: &Path,
    ) -> Result<(), MergeError> {
        let (entry, purged) = {
            let mut pending = self.lock();
            let purged = purge_expired(&mut pending, self.ttl);
            (pending.remove(merge_id), purged)
        };
        for stale in purged {
            discard(&stale).await;
        }

        let entry = entry.ok_or(MergeError::InvalidMergeId)?;
        if entry.created_at.elapsed() > self.ttl {
            discard(&entry.first_input).await;
            return Err(MergeError::InvalidMergeId);
        }

        let result = self
            .executor
            .merge(&entry.first_input, second_input, merged_output)
            .await;

        // Raw inputs are consumed by the attempt, success or not.
        discard(&entry.first_input).await;
        discard(second_input).await;

        let output = result.map_err(MergeError::Io)?;
        if !output.status.success() {
            // A half-written output must not be mistaken for valid input later.
            let _ = tokio::fs::remove_file(merged_output).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("; ");
            tracing::error!(merge = %merge_id, "external merge failed: {}", tail);
            return Err(MergeError::Failed(format!(
                "merge step exited with {}",
                output.status
            )));
        }

        tracing::info!(merge = %merge_id, output = %merged_output.display(), "merge completed");
        Ok(())
    }
}

/// Drop every pending entry older than the TTL, returning the staged first
/// inputs so the caller can delete them outside the lock.
fn purge_expired(pending: &mut HashMap<String, PendingMerge>, ttl: Duration) -> Vec<PathBuf> {
    let expired: Vec<String> = pending
        .iter()
        .filter(|(_, p)| p.created_at.elapsed() > ttl)
        .map(|(id, _)| id.clone())
        .collect();

    expired
        .into_iter()
        .filter_map(|id| {
            tracing::info!(merge = %id, "pending merge expired");
            pending.remove(&id).map(|p| p.first_input)
        })
        .collect()
}

/// Best-effort removal of a consumed input file.
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "failed to remove input: {}", e);
        }
    }
}
