//! Supervision of external ffmpeg transcoder processes.
//!
//! Each stream session owns exactly one transcoder process. The process is
//! spawned fire-and-forget; a monitor task owns the child, drives the
//! graceful-then-forced stop protocol, and reports the eventual exit to the
//! registry over an event channel. The supervisor never restarts a crashed
//! process.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::Config;

/// How a session's transcoder should be brought down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM first, SIGKILL after the grace period.
    Graceful,
    /// SIGKILL immediately.
    Forced,
}

/// Exit notification delivered to the registry reconciler.
#[derive(Debug)]
pub struct ExitEvent {
    pub stream_id: String,
    pub status: Option<ExitStatus>,
}

/// Handle to a running transcoder. Cheap to query; stopping only *requests*
/// termination, the monitor task performs it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    stop_tx: mpsc::UnboundedSender<StopMode>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True until the monitor has observed an exit or kill.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Request termination. No-op once the process has exited.
    pub fn stop(&self, mode: StopMode) {
        if !self.is_alive() {
            return;
        }
        let _ = self.stop_tx.send(mode);
    }

    #[cfg(test)]
    pub fn stub(alive: bool) -> (Self, mpsc::UnboundedReceiver<StopMode>) {
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let handle = Self {
            pid: Some(4242),
            alive: Arc::new(AtomicBool::new(alive)),
            stop_tx,
        };
        (handle, stop_rx)
    }
}

/// A freshly spawned transcoder. The monitor must be handed to `tokio::spawn`
/// once the session is registered; until then no exit event can fire.
pub struct SpawnedTranscoder {
    pub handle: ProcessHandle,
    pub monitor: ProcessMonitor,
}

/// Owns the child process until it exits.
pub struct ProcessMonitor {
    stream_id: String,
    child: Child,
    alive: Arc<AtomicBool>,
    stop_rx: mpsc::UnboundedReceiver<StopMode>,
    grace: Duration,
}

impl ProcessMonitor {
    /// Wait for the child to exit, serving stop requests along the way, then
    /// report the exit status. The grace timer races the child's own exit, so
    /// a process that dies early never receives a redundant SIGKILL.
    pub async fn watch(mut self, exit_tx: mpsc::UnboundedSender<ExitEvent>) {
        let status = loop {
            tokio::select! {
                status = self.child.wait() => break status.ok(),
                Some(mode) = self.stop_rx.recv() => match mode {
                    StopMode::Forced => {
                        let _ = self.child.start_kill();
                    }
                    StopMode::Graceful => {
                        if let Some(pid) = self.child.id() {
                            send_term(pid);
                        }
                        tokio::select! {
                            status = self.child.wait() => break status.ok(),
                            _ = tokio::time::sleep(self.grace) => {
                                tracing::warn!(
                                    stream = %self.stream_id,
                                    "transcoder ignored SIGTERM for {:?}, killing",
                                    self.grace
                                );
                                let _ = self.child.start_kill();
                            }
                        }
                    }
                },
            }
        };

        self.alive.store(false, Ordering::SeqCst);
        tracing::info!(stream = %self.stream_id, "transcoder exited: {:?}", status);
        let _ = exit_tx.send(ExitEvent {
            stream_id: self.stream_id,
            status,
        });
    }
}

/// Launch the external transcoder against `input`, looping forever and
/// writing an HLS playlist plus segments into `out_dir`. Returns as soon as
/// the process is spawned.
pub fn spawn_transcoder(
    stream_id: &str,
    input: &Path,
    out_dir: &Path,
    config: &Config,
) -> io::Result<SpawnedTranscoder> {
    let mut child = Command::new("ffmpeg")
        .args(transcode_args(input, out_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id();
    if let Some(pid) = pid {
        lower_priority(pid);
    }

    // Diagnostic text is logged, never parsed.
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stream_id.to_owned(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stream_id.to_owned(), "stderr", stderr);
    }

    let alive = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = mpsc::unbounded_channel();

    tracing::info!(stream = %stream_id, pid = ?pid, "transcoder started");

    Ok(SpawnedTranscoder {
        handle: ProcessHandle {
            pid,
            alive: alive.clone(),
            stop_tx,
        },
        monitor: ProcessMonitor {
            stream_id: stream_id.to_owned(),
            child,
            alive,
            stop_rx,
            grace: config.stop_grace,
        },
    })
}

/// ffmpeg argument list for a looping low-latency HLS encode. Segment
/// retention is delegated to the playlist-size and delete_segments flags.
fn transcode_args(input: &Path, out_dir: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-stream_loop", "-1", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(input.as_os_str().to_owned());
    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-g",
            "48",
            "-c:a",
            "aac",
            "-b:a",
            "96k",
            "-f",
            "hls",
            "-hls_time",
            "6",
            "-hls_list_size",
            "10",
            "-hls_flags",
            "delete_segments+append_list",
            "-hls_segment_filename",
        ]
        .iter()
        .map(OsString::from),
    );
    args.push(out_dir.join("segment_%05d.ts").into_os_string());
    args.push(out_dir.join("index.m3u8").into_os_string());
    args
}

/// Lower the OS scheduling priority of a spawned transcoder. Best-effort:
/// a missing renice binary or insufficient permissions are not errors.
fn lower_priority(pid: u32) {
    tokio::spawn(async move {
        match Command::new("renice")
            .arg("+10")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::debug!("renice {} exited with {}", pid, status),
            Err(e) => tracing::debug!("renice unavailable: {}", e),
        }
    });
}

/// Forward one of the child's output streams to the log, line by line.
fn forward_lines<R>(stream_id: String, channel: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "transcoder", stream = %stream_id, channel, "{}", line);
        }
    });
}

#[cfg(unix)]
fn send_term(pid: u32) {
    // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped.
    unsafe {
        nix::libc::kill(pid as i32, nix::libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_term(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            addr: String::new(),
            port: String::new(),
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("output"),
            max_file_size: 1024,
            max_concurrent_streams: 10,
            stop_grace: Duration::from_millis(200),
            merge_ttl: Duration::from_secs(300),
        }
    }

    #[test]
    fn transcode_args_loop_and_layout() {
        let args = transcode_args(Path::new("in.mp4"), Path::new("/tmp/out/demo_1"));
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let loop_pos = args.iter().position(|a| a == "-stream_loop");
        assert_eq!(args[loop_pos.unwrap() + 1], "-1");
        assert!(args.contains(&"/tmp/out/demo_1/segment_%05d.ts".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/out/demo_1/index.m3u8");
    }

    #[tokio::test]
    async fn stub_handle_stop_sends_request() {
        let (handle, mut stop_rx) = ProcessHandle::stub(true);
        assert!(handle.is_alive());
        handle.stop(StopMode::Graceful);
        assert_eq!(stop_rx.recv().await, Some(StopMode::Graceful));
    }

    #[tokio::test]
    async fn stopping_dead_handle_is_a_noop() {
        let (handle, mut stop_rx) = ProcessHandle::stub(false);
        handle.stop(StopMode::Forced);
        assert!(stop_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn monitor_reports_exit_of_short_lived_process() {
        let child = Command::new("true")
            .stdin(Stdio::null())
            .spawn()
            .expect("spawn true");

        let alive = Arc::new(AtomicBool::new(true));
        let (_stop_tx, stop_rx) = mpsc::unbounded_channel::<StopMode>();
        let monitor = ProcessMonitor {
            stream_id: "demo_1".into(),
            child,
            alive: alive.clone(),
            stop_rx,
            grace: test_config().stop_grace,
        };

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        monitor.watch(exit_tx).await;

        let event = exit_rx.recv().await.expect("exit event");
        assert_eq!(event.stream_id, "demo_1");
        assert!(event.status.map(|s| s.success()).unwrap_or(false));
        assert!(!alive.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn graceful_stop_terminates_a_running_process() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .expect("spawn sleep");

        let alive = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let monitor = ProcessMonitor {
            stream_id: "demo_2".into(),
            child,
            alive: alive.clone(),
            stop_rx,
            grace: Duration::from_secs(2),
        };

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(monitor.watch(exit_tx));

        stop_tx.send(StopMode::Graceful).expect("send stop");
        let event = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .expect("stop within grace window")
            .expect("exit event");
        assert_eq!(event.stream_id, "demo_2");
        assert!(!alive.load(Ordering::SeqCst));
        watcher.await.expect("watcher join");
    }
}
