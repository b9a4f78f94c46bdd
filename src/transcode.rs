//! The transcode supervisor. Grounded directly on `fritztv/src/
//! transcoder.rs`: the `tokio::sync::watch`-based stop signal, the stderr
//! ring buffer, and the per-file single-job map modeled on `manager.rs`'s
//! `StreamManager`. The jobs map is the sole owner of each job's stop
//! signal; the response body gets its own independent stop-on-drop guard
//! rather than a shared `Arc`, so replacing a job never depends on the old
//! response body having already been dropped. Unlike `fritztv` (one RTSP
//! tuner fanned out to many viewers via `broadcast`), a remux here has
//! exactly one consumer, so stdout is piped straight into the response
//! instead of reassembled into broadcast fragments. URL-driven only (input
//! is the internal loopback endpoint), never stdin-fed, since stdin-fed
//! ffmpeg can't seek.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::metrics::{ACTIVE_TRANSCODES, TRANSCODE_CPU_USAGE};

#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    pub seek_seconds: f64,
    pub audio_track_index: u32,
    pub transcode_audio: bool,
}

/// The supervisor's own record of a running job. Holding this, not a shared
/// `Arc` with the response body, is what lets `start()` kill the previous
/// job unconditionally instead of hoping a refcount reaches zero.
struct ActiveJob {
    stop_signal: watch::Sender<bool>,
    done_rx: oneshot::Receiver<()>,
    seek_sequence: u64,
}

impl ActiveJob {
    /// Signals the job to stop and waits for its exit logger to finish
    /// tearing it down (killing the child, clearing its metrics).
    async fn stop_and_wait(self) {
        let _ = self.stop_signal.send(true);
        let _ = self.done_rx.await;
    }
}

/// Sent into the response body so a dropped/finished stream (client
/// disconnect, normal completion) also signals stop, independent of
/// whatever the jobs map is doing with its own copy of the same job.
struct StopGuard {
    stop_signal: watch::Sender<bool>,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        let _ = self.stop_signal.send(true);
    }
}

/// At most one active job per file id. Starting a new job explicitly signals
/// and awaits the previous one's teardown before registering the new one, so
/// a still-alive response body for a superseded job can never keep the old
/// ffmpeg running alongside a new one.
pub struct TranscodeSupervisor {
    jobs: Mutex<HashMap<i64, ActiveJob>>,
    internal_base_url: String,
    next_seek_sequence: AtomicU64,
}

/// Lets a frontend reject stale `loadedmetadata` callbacks from a superseded
/// seek by comparing against the sequence number it was started with.
pub struct TranscodeHandle {
    pub seek_sequence: u64,
    pub body: TranscodeBody,
}

impl TranscodeSupervisor {
    pub fn new(internal_base_url: impl Into<String>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            internal_base_url: internal_base_url.into(),
            next_seek_sequence: AtomicU64::new(0),
        }
    }

    pub async fn start(&self, file_id: i64, options: TranscodeOptions) -> AppResult<TranscodeHandle> {
        let previous = self.jobs.lock().await.remove(&file_id);
        if let Some(previous) = previous {
            previous.stop_and_wait().await;
        }

        let seek_sequence = self.next_seek_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let url = format!("{}/internal/raw/{file_id}", self.internal_base_url);
        let mut args: Vec<String> = Vec::new();
        if options.seek_seconds > 0.0 {
            args.extend(["-ss".into(), format!("{:.3}", options.seek_seconds)]);
        }
        args.extend(["-i".into(), url.clone()]);
        args.extend([
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            format!("0:a:{}", options.audio_track_index),
            "-c:v".into(),
            "copy".into(),
        ]);
        if options.transcode_audio {
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-ac".into(),
                "2".into(),
                "-b:a".into(),
                "192k".into(),
            ]);
        } else {
            args.extend(["-c:a".into(), "copy".into()]);
        }
        args.extend([
            "-f".into(),
            "mp4".into(),
            "-movflags".into(),
            "frag_keyframe+empty_moov+default_base_moof".into(),
            "-frag_duration".into(),
            "1000000".into(),
            "pipe:1".into(),
        ]);

        info!(file_id, seek_sequence, seek = options.seek_seconds, "starting transcode job");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::ToolMissing(format!("ffmpeg: {e}")))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        if let Some(pid) = child.id() {
            spawn_cpu_monitor(pid, file_id, stop_rx.clone());
        }
        let stderr_ring = spawn_stderr_reader(stderr);
        spawn_exit_logger(child, file_id, seek_sequence, stderr_ring, stop_rx, done_tx);

        let job = ActiveJob {
            stop_signal: stop_tx.clone(),
            done_rx,
            seek_sequence,
        };
        ACTIVE_TRANSCODES.inc();
        self.jobs.lock().await.insert(file_id, job);

        Ok(TranscodeHandle {
            seek_sequence,
            body: TranscodeBody {
                inner: ReaderStream::new(stdout),
                _guard: StopGuard { stop_signal: stop_tx },
            },
        })
    }

    /// Kills every active job, waiting for each to actually tear down;
    /// called from the shutdown path.
    pub async fn kill_all(&self) {
        let jobs: Vec<ActiveJob> = self.jobs.lock().await.drain().map(|(_, job)| job).collect();
        let count = jobs.len();
        for job in jobs {
            job.stop_and_wait().await;
        }
        if count > 0 {
            info!(count, "killed all active transcode jobs for shutdown");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

fn spawn_cpu_monitor(pid: u32, file_id: i64, mut stop_rx: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    let targets = sysinfo::ProcessesToUpdate::Some(&[pid]);
                    sys.refresh_processes(targets, true);
                    match sys.process(pid) {
                        Some(process) => {
                            TRANSCODE_CPU_USAGE
                                .with_label_values(&[&file_id.to_string()])
                                .set(process.cpu_usage() as f64);
                        }
                        None => break,
                    }
                }
            }
        }
    });
}

fn spawn_stderr_reader(stderr: tokio::process::ChildStderr) -> Arc<Mutex<VecDeque<String>>> {
    let ring = Arc::new(Mutex::new(VecDeque::with_capacity(50)));
    let ring_for_reader = ring.clone();
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim().to_string();
                    let mut guard = ring_for_reader.lock().await;
                    if guard.len() >= 50 {
                        guard.pop_front();
                    }
                    guard.push_back(trimmed.clone());
                    debug!(ffmpeg = %trimmed, "transcode stderr");
                }
            }
        }
    });
    ring
}

fn spawn_exit_logger(
    mut child: Child,
    file_id: i64,
    seek_sequence: u64,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: oneshot::Sender<()>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = stop_rx.changed() => {
                let _ = child.kill().await;
                info!(file_id, seek_sequence, "transcode job stopped");
            }
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => {
                        debug!(file_id, seek_sequence, "transcode job exited cleanly");
                    }
                    Ok(status) => {
                        let ring = stderr_ring.lock().await;
                        warn!(
                            file_id,
                            seek_sequence,
                            %status,
                            stderr = %ring.iter().cloned().collect::<Vec<_>>().join("\n"),
                            "transcode job exited with error"
                        );
                    }
                    Err(e) => error!(file_id, seek_sequence, error = %e, "transcode wait() failed"),
                }
            }
        }
        TRANSCODE_CPU_USAGE.with_label_values(&[&file_id.to_string()]).set(0.0);
        ACTIVE_TRANSCODES.dec();
        let _ = done_tx.send(());
    });
}

/// A byte stream wired directly from the ffmpeg child's stdout. Dropping the
/// stream (response closed, stream error, or normal completion) fires
/// `StopGuard`'s drop, which signals the child to stop independently of
/// whatever the supervisor's jobs map is doing with that file id.
pub struct TranscodeBody {
    inner: ReaderStream<tokio::process::ChildStdout>,
    _guard: StopGuard,
}

impl Stream for TranscodeBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_next(cx)
    }
}
