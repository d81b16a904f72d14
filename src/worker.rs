//! Per-slot stream workers.
//!
//! A worker cycles `Connecting -> Streaming -> Failed -> Connecting` until
//! its stop token fires. Every wait and every pull races the token, so a
//! stop is observed within one sleep granularity whatever the state.

use crate::config::{CameraConfig, SLOT_COUNT};
use crate::error::StreamError;
use crate::source::DecodeSource;
use crate::state::{ConnectionState, TileState};
use crate::target::{build_target, display_endpoint};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const RETRY_DELAY: Duration = Duration::from_secs(3);
pub const EMPTY_PULL_BACKOFF: Duration = Duration::from_millis(100);
pub const STALL_THRESHOLD: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimings {
    /// Pause after a failed connect or a stalled session.
    pub retry_delay: Duration,
    /// Pause after a pull that produced no frame.
    pub empty_pull_backoff: Duration,
    /// Consecutive empty pulls tolerated before the session is dropped.
    pub stall_threshold: u32,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            retry_delay: RETRY_DELAY,
            empty_pull_backoff: EMPTY_PULL_BACKOFF,
            stall_threshold: STALL_THRESHOLD,
        }
    }
}

enum SessionEnd {
    Stopped,
    Stalled(StreamError),
}

/// Drives one slot until `stop` is cancelled.
pub async fn run_stream_worker<S: DecodeSource>(
    slot: usize,
    source: Arc<S>,
    target: String,
    tile: Arc<TileState>,
    timings: WorkerTimings,
    stop: CancellationToken,
) {
    let endpoint = display_endpoint(&target);
    info!(slot, %endpoint, "stream worker started");

    while !stop.is_cancelled() {
        // A previous session's picture must not outlive the reconnect.
        tile.mailbox().clear();
        tile.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            biased;
            () = stop.cancelled() => None,
            opened = source.open(&target) => Some(opened),
        };
        let Some(opened) = opened else {
            break;
        };

        match opened {
            Ok(handle) => {
                tile.set_state(ConnectionState::Streaming);
                info!(slot, %endpoint, "streaming");
                match stream_session(slot, source.as_ref(), handle, &tile, timings, &stop).await {
                    SessionEnd::Stopped => break,
                    SessionEnd::Stalled(err) => {
                        warn!(slot, %endpoint, "{err}");
                        tile.set_error(err.to_string());
                        tile.set_state(ConnectionState::Failed);
                    }
                }
            }
            Err(err) => {
                warn!(slot, %endpoint, "{err}");
                tile.set_error(err.to_string());
                tile.set_state(ConnectionState::Failed);
            }
        }

        if !wait_or_stop(&stop, timings.retry_delay).await {
            break;
        }
    }

    info!(slot, "stream worker stopped");
}

async fn stream_session<S: DecodeSource>(
    slot: usize,
    source: &S,
    mut handle: S::Handle,
    tile: &TileState,
    timings: WorkerTimings,
    stop: &CancellationToken,
) -> SessionEnd {
    let mut misses = 0_u32;

    loop {
        let pulled = tokio::select! {
            biased;
            () = stop.cancelled() => None,
            pulled = source.next_frame(&mut handle) => Some(pulled),
        };
        let Some(pulled) = pulled else {
            source.release(handle);
            return SessionEnd::Stopped;
        };

        match pulled {
            Ok(Some(frame)) => {
                misses = 0;
                if stop.is_cancelled() {
                    source.release(handle);
                    return SessionEnd::Stopped;
                }
                tile.mailbox().publish(frame);
                continue;
            }
            Ok(None) => {}
            Err(err) => debug!(slot, "pull failed: {err}"),
        }

        misses = misses.saturating_add(1);
        if misses > timings.stall_threshold {
            source.release(handle);
            return SessionEnd::Stalled(StreamError::Stall { misses });
        }

        if !wait_or_stop(stop, timings.empty_pull_backoff).await {
            source.release(handle);
            return SessionEnd::Stopped;
        }
    }
}

/// Sleeps for `duration`; returns `false` if `stop` fired first.
async fn wait_or_stop(stop: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        () = stop.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

/// Outcome of waiting for a worker to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Stopped,
    TimedOut,
}

/// Owner-side handle of a worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    slot: usize,
    stop: CancellationToken,
    done: oneshot::Receiver<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Runs `body` on a named thread; the handle completes when `body` returns.
    pub fn spawn<F>(slot: usize, stop: CancellationToken, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name(format!("stream-slot-{}", slot + 1))
            .spawn(move || {
                body();
                let _ = done_tx.send(());
            })
            .with_context(|| format!("failed spawning worker thread for slot {}", slot + 1))?;

        Ok(Self {
            slot,
            stop,
            done: done_rx,
            thread: Some(thread),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn signal_stop(&self) {
        self.stop.cancel();
    }

    /// Waits up to `timeout` for the worker to exit. A worker that misses the
    /// deadline is detached and left to die with the process.
    pub async fn join(mut self, timeout: Duration) -> JoinOutcome {
        match tokio::time::timeout(timeout, &mut self.done).await {
            Ok(_) => {
                if let Some(thread) = self.thread.take()
                    && thread.join().is_err()
                {
                    error!(slot = self.slot, "worker thread panicked");
                }
                JoinOutcome::Stopped
            }
            Err(_elapsed) => JoinOutcome::TimedOut,
        }
    }
}

/// Spawns a stream worker thread with its own single-threaded runtime.
pub fn spawn_stream_worker<S: DecodeSource>(
    camera: &CameraConfig,
    source: Arc<S>,
    tile: Arc<TileState>,
    timings: WorkerTimings,
) -> Result<WorkerHandle> {
    let slot = camera.slot;
    let target = build_target(camera);
    let stop = CancellationToken::new();
    let worker_stop = stop.clone();

    WorkerHandle::spawn(slot, stop, move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(slot, "failed building worker runtime: {err}");
                tile.set_error(format!("runtime error: {err}"));
                tile.set_state(ConnectionState::Failed);
                return;
            }
        };
        runtime.block_on(run_stream_worker(
            slot,
            source,
            target,
            tile,
            timings,
            worker_stop,
        ));
        drop(runtime);
    })
}

/// Creates the tile for every slot and starts workers for the enabled ones.
pub fn start_slot_workers<S: DecodeSource>(
    cameras: &[CameraConfig; SLOT_COUNT],
    source: &Arc<S>,
    timings: WorkerTimings,
) -> Result<([Arc<TileState>; SLOT_COUNT], Vec<WorkerHandle>)> {
    let tiles: [Arc<TileState>; SLOT_COUNT] = std::array::from_fn(|idx| {
        if cameras[idx].is_disabled() {
            Arc::new(TileState::disabled())
        } else {
            Arc::new(TileState::new())
        }
    });

    let mut handles = Vec::with_capacity(SLOT_COUNT);
    for (camera, tile) in cameras.iter().zip(&tiles) {
        if camera.is_disabled() {
            debug!(slot = camera.slot, "slot disabled, no worker");
            continue;
        }
        match spawn_stream_worker(camera, source.clone(), tile.clone(), timings) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                for started in &handles {
                    started.signal_stop();
                }
                return Err(err);
            }
        }
    }

    Ok((tiles, handles))
}

#[cfg(test)]
mod tests {
    use super::{JoinOutcome, WorkerHandle, WorkerTimings, run_stream_worker, start_slot_workers};
    use crate::config::parse_cameras;
    use crate::error::StreamError;
    use crate::mailbox::{Frame, PixelLayout};
    use crate::source::DecodeSource;
    use crate::state::{ConnectionState, TileState};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, Copy)]
    enum Pull {
        Frame,
        Empty,
        Fail,
    }

    /// Scripted source: `open` follows `opens` then repeats its last entry,
    /// pulls follow `pulls` then repeat `Empty`.
    #[derive(Debug, Default)]
    struct ScriptedSource {
        opens_ok: Mutex<VecDeque<bool>>,
        open_default: bool,
        pulls: Mutex<VecDeque<Pull>>,
        open_times: Mutex<Vec<Instant>>,
        pull_count: AtomicU32,
        released: AtomicU32,
        live_handles: AtomicU32,
    }

    impl ScriptedSource {
        fn always_failing() -> Self {
            Self::default()
        }

        fn opening(pulls: Vec<Pull>) -> Self {
            Self {
                open_default: true,
                pulls: Mutex::new(pulls.into()),
                ..Self::default()
            }
        }

        fn opens(&self) -> usize {
            self.open_times.lock().len()
        }
    }

    #[derive(Debug)]
    struct ScriptedHandle;

    impl DecodeSource for ScriptedSource {
        type Handle = ScriptedHandle;

        async fn open(&self, _target: &str) -> Result<ScriptedHandle, StreamError> {
            self.open_times.lock().push(Instant::now());
            let ok = self.opens_ok.lock().pop_front().unwrap_or(self.open_default);
            if ok {
                self.live_handles.fetch_add(1, Ordering::SeqCst);
                Ok(ScriptedHandle)
            } else {
                Err(StreamError::Connect("connection refused".to_owned()))
            }
        }

        async fn next_frame(
            &self,
            _handle: &mut ScriptedHandle,
        ) -> Result<Option<Frame>, StreamError> {
            self.pull_count.fetch_add(1, Ordering::SeqCst);
            match self.pulls.lock().pop_front().unwrap_or(Pull::Empty) {
                Pull::Frame => Ok(Some(Frame::new(2, 2, PixelLayout::Rgb8, vec![9; 12]))),
                Pull::Empty => Ok(None),
                Pull::Fail => Err(StreamError::Decode("corrupt NAL".to_owned())),
            }
        }

        fn release(&self, _handle: ScriptedHandle) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn spawn_worker(
        source: &Arc<ScriptedSource>,
        tile: &Arc<TileState>,
        stop: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run_stream_worker(
            0,
            source.clone(),
            "rtsp://10.0.0.5:554/live".to_owned(),
            tile.clone(),
            WorkerTimings::default(),
            stop.clone(),
        ))
    }

    async fn advance_to(start: Instant, millis: u64) {
        tokio::time::sleep_until(start + Duration::from_millis(millis)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_source_cycles_between_connecting_and_failed() {
        let source = Arc::new(ScriptedSource::always_failing());
        let tile = Arc::new(TileState::new());
        let stop = CancellationToken::new();
        let start = Instant::now();
        let worker = spawn_worker(&source, &tile, &stop);

        advance_to(start, 10).await;
        assert_eq!(tile.state(), ConnectionState::Failed);
        assert_eq!(source.opens(), 1);

        advance_to(start, 3_010).await;
        assert_eq!(source.opens(), 2);
        advance_to(start, 9_010).await;
        assert_eq!(source.opens(), 4);
        assert_eq!(tile.state(), ConnectionState::Failed);

        let times = source.open_times.lock().clone();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(3));
        }
        assert_eq!(source.pull_count.load(Ordering::SeqCst), 0);
        assert!(tile.last_error().is_some_and(|err| err.contains("refused")));

        stop.cancel();
        worker.await.expect("worker task");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_source_fails_only_after_threshold_is_exceeded() {
        let source = Arc::new(ScriptedSource::opening(Vec::new()));
        let tile = Arc::new(TileState::new());
        let stop = CancellationToken::new();
        let start = Instant::now();
        let worker = spawn_worker(&source, &tile, &stop);

        // Pulls land at 0, 100, ..., 4900 ms: fifty misses, still tolerated.
        advance_to(start, 4_950).await;
        assert_eq!(tile.state(), ConnectionState::Streaming);
        assert_eq!(source.pull_count.load(Ordering::SeqCst), 50);

        // The 51st miss at 5000 ms exceeds the threshold.
        advance_to(start, 5_050).await;
        assert_eq!(tile.state(), ConnectionState::Failed);
        assert_eq!(source.pull_count.load(Ordering::SeqCst), 51);
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
        assert_eq!(source.opens(), 1);

        // Then the regular retry delay before reconnecting.
        advance_to(start, 7_950).await;
        assert_eq!(source.opens(), 1);
        advance_to(start, 8_050).await;
        assert_eq!(source.opens(), 2);
        assert_eq!(tile.state(), ConnectionState::Streaming);

        stop.cancel();
        worker.await.expect("worker task");
    }

    #[tokio::test(start_paused = true)]
    async fn pull_failures_count_like_empty_pulls_and_frames_reset_the_counter() {
        let mut pulls = vec![Pull::Fail; 40];
        pulls.push(Pull::Frame);
        pulls.extend(vec![Pull::Fail; 40]);
        let source = Arc::new(ScriptedSource::opening(pulls));
        let tile = Arc::new(TileState::new());
        let stop = CancellationToken::new();
        let start = Instant::now();
        let worker = spawn_worker(&source, &tile, &stop);

        // Over 80 misses by now, but never more than 50 in a row.
        advance_to(start, 8_050).await;
        assert_eq!(tile.state(), ConnectionState::Streaming);
        assert_eq!(tile.mailbox().published(), 1);
        assert_eq!(source.opens(), 1);

        stop.cancel();
        worker.await.expect("worker task");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_starts_without_the_previous_sessions_frame() {
        let source = Arc::new(ScriptedSource::opening(vec![Pull::Frame]));
        let tile = Arc::new(TileState::new());
        let stop = CancellationToken::new();
        let start = Instant::now();
        let worker = spawn_worker(&source, &tile, &stop);

        advance_to(start, 50).await;
        assert!(tile.mailbox().read().is_some());

        // One frame, then 51 misses: failed near 5000 ms, reopened at 8000 ms.
        advance_to(start, 8_050).await;
        assert_eq!(source.opens(), 2);
        assert_eq!(tile.state(), ConnectionState::Streaming);
        assert!(tile.mailbox().read().is_none());
        assert_eq!(tile.mailbox().published(), 1);

        stop.cancel();
        worker.await.expect("worker task");
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_published_while_streaming() {
        let source = Arc::new(ScriptedSource::opening(vec![Pull::Frame; 3]));
        let tile = Arc::new(TileState::new());
        let stop = CancellationToken::new();
        let start = Instant::now();
        let worker = spawn_worker(&source, &tile, &stop);

        advance_to(start, 50).await;
        assert_eq!(tile.state(), ConnectionState::Streaming);
        assert_eq!(tile.mailbox().published(), 3);
        let frame = tile.mailbox().read().expect("frame");
        assert_eq!((frame.width, frame.height), (2, 2));

        stop.cancel();
        worker.await.expect("worker task");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_retry_delay_promptly() {
        let source = Arc::new(ScriptedSource::always_failing());
        let tile = Arc::new(TileState::new());
        let stop = CancellationToken::new();
        let start = Instant::now();
        let worker = spawn_worker(&source, &tile, &stop);

        advance_to(start, 1_000).await;
        let stopped_at = Instant::now();
        stop.cancel();
        worker.await.expect("worker task");

        assert!(Instant::now() - stopped_at <= Duration::from_millis(100));
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_streaming_releases_connection_and_stops_publishing() {
        let source = Arc::new(ScriptedSource::opening(vec![Pull::Frame]));
        let tile = Arc::new(TileState::new());
        let stop = CancellationToken::new();
        let start = Instant::now();
        let worker = spawn_worker(&source, &tile, &stop);

        advance_to(start, 250).await;
        stop.cancel();
        worker.await.expect("worker task");

        assert_eq!(source.released.load(Ordering::SeqCst), 1);
        assert_eq!(source.live_handles.load(Ordering::SeqCst), 0);
        let published = tile.mailbox().published();
        source.pulls.lock().extend([Pull::Frame, Pull::Frame]);
        advance_to(start, 1_000).await;
        assert_eq!(tile.mailbox().published(), published);
        assert_eq!(tile.state(), ConnectionState::Streaming);
    }

    #[tokio::test]
    async fn non_cooperative_worker_times_out_on_join() {
        let release = Arc::new(AtomicBool::new(false));
        let body_release = release.clone();
        let handle = WorkerHandle::spawn(0, CancellationToken::new(), move || {
            while !body_release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
        })
        .expect("spawn");

        handle.signal_stop();
        assert_eq!(
            handle.join(Duration::from_millis(50)).await,
            JoinOutcome::TimedOut
        );
        release.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn example_config_starts_one_worker_and_leaves_other_slots_disabled() {
        let cameras = parse_cameras(r#"[{"ip": "10.0.0.5", "port": 554}, {}, {}, {}]"#)
            .expect("valid config");
        let source = Arc::new(ScriptedSource::always_failing());
        let (tiles, handles) =
            start_slot_workers(&cameras, &source, WorkerTimings::default()).expect("spawned");

        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].slot(), 0);
        for tile in &tiles[1..] {
            assert_eq!(tile.state(), ConnectionState::Disabled);
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while tiles[0].state() != ConnectionState::Failed && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tiles[0].state(), ConnectionState::Failed);

        for handle in handles {
            handle.signal_stop();
            assert_eq!(handle.join(Duration::from_secs(2)).await, JoinOutcome::Stopped);
        }
        for tile in &tiles[1..] {
            assert_eq!(tile.state(), ConnectionState::Disabled);
        }
    }
}
