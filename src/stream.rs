//! Per-source capture stream.
//!
//! A `CameraStream` binds one source configuration to a capture thread that
//! reads frames on its own schedule and publishes the newest one into a
//! `FrameSlot`. Streams fail independently: an unreachable or flaky source
//! surfaces through `SourceStatus`, never as a fault that crosses into other
//! streams or the registry.
//!
//! Lifecycle is a two-state machine, Stopped and Running, with transitions
//! only through `start` and `stop`. Reconfiguration is stop, apply fields,
//! conditionally restart; never an in-place mutation of a running loop.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameSlot};
use crate::lock_unpoisoned;
use crate::source::{CaptureOptions, VideoSource};

/// Pause after a failed read before the loop retries.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);
/// How long `stop` waits for the capture thread before detaching it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

const DEFAULT_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

fn default_enabled() -> bool {
    true
}
fn default_fps() -> u32 {
    DEFAULT_FPS
}
fn default_width() -> u32 {
    DEFAULT_WIDTH
}
fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

/// Configuration of one video source. `id` is immutable for the lifetime of
/// the stream; everything else can change through [`SourceConfigPatch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    /// URI (`rtsp://…`), device index or path (`0`, `/dev/video0`), or a
    /// synthetic `stub://` locator.
    pub locator: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl SourceConfig {
    pub(crate) fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            width: self.width,
            height: self.height,
            target_fps: self.fps,
        }
    }

    fn frame_interval(&self) -> Duration {
        if self.fps == 0 {
            Duration::from_millis(100)
        } else {
            Duration::from_secs_f64(1.0 / f64::from(self.fps))
        }
    }
}

/// Partial configuration update. Unset fields are left untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SourceConfigPatch {
    pub name: Option<String>,
    pub locator: Option<String>,
    pub enabled: Option<bool>,
    pub fps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl SourceConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.locator.is_none()
            && self.enabled.is_none()
            && self.fps.is_none()
            && self.width.is_none()
            && self.height.is_none()
    }

    fn apply_to(&self, config: &mut SourceConfig) {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(locator) = &self.locator {
            config.locator = locator.clone();
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
    }
}

/// Point-in-time view of a stream's health. Always a copy, never a live
/// reference into stream internals.
#[derive(Clone, Debug, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub connected: bool,
    /// Measured delivery rate over the last completed 1-second window, as
    /// opposed to the configured target rate.
    pub fps_actual: f64,
    pub frame_count: u64,
    pub last_error: Option<String>,
}

impl SourceStatus {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            connected: false,
            fps_actual: 0.0,
            frame_count: 0,
            last_error: None,
        }
    }
}

/// State shared between the owning stream and its capture thread. The slot
/// and status each have their own lock, scoped to this stream only.
struct StreamShared {
    running: AtomicBool,
    slot: FrameSlot,
    status: Mutex<SourceStatus>,
}

struct StreamState {
    config: SourceConfig,
    worker: Option<JoinHandle<()>>,
}

/// One video source with its capture loop.
pub struct CameraStream {
    id: String,
    shared: Arc<StreamShared>,
    state: Mutex<StreamState>,
}

impl CameraStream {
    pub fn new(config: SourceConfig) -> Self {
        let id = config.id.clone();
        Self {
            shared: Arc::new(StreamShared {
                running: AtomicBool::new(false),
                slot: FrameSlot::new(),
                status: Mutex::new(SourceStatus::new(&id)),
            }),
            state: Mutex::new(StreamState {
                config,
                worker: None,
            }),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> SourceConfig {
        lock_unpoisoned(&self.state).config.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Open the source and spawn the capture loop. No-op `Ok` when already
    /// running. On open failure the error is also recorded in status and no
    /// loop is spawned.
    pub fn start(&self) -> Result<()> {
        let mut state = lock_unpoisoned(&self.state);
        self.start_locked(&mut state)
    }

    fn start_locked(&self, state: &mut StreamState) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let options = state.config.capture_options();
        let source = match VideoSource::open(&state.config.locator, &options) {
            Ok(source) => source,
            Err(err) => {
                let mut status = lock_unpoisoned(&self.shared.status);
                status.connected = false;
                status.last_error = Some(format!("{err:#}"));
                return Err(err);
            }
        };

        {
            let mut status = lock_unpoisoned(&self.shared.status);
            status.connected = true;
            status.last_error = None;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let config = state.config.clone();
        state.worker = Some(std::thread::spawn(move || {
            capture_loop(shared, config, source);
        }));
        log::info!("stream {} started", self.id);
        Ok(())
    }

    /// Signal the capture loop to end and wait for it within a bounded
    /// timeout. Safe on a never-started or already-stopped stream. Clears the
    /// frame slot; the frame counter is preserved.
    pub fn stop(&self) {
        let mut state = lock_unpoisoned(&self.state);
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut StreamState) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = state.worker.take() {
            let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                std::thread::sleep(STOP_POLL_INTERVAL);
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    log::warn!("capture thread for {} panicked", self.id);
                }
            } else {
                // Detached worker releases the capture handle itself once it
                // observes the stop flag; it must not publish afterwards.
                log::warn!(
                    "capture thread for {} did not exit within {:?}, detaching",
                    self.id,
                    STOP_JOIN_TIMEOUT
                );
                drop(worker);
            }
            log::info!("stream {} stopped", self.id);
        }
        self.shared.slot.clear();
        let mut status = lock_unpoisoned(&self.shared.status);
        status.connected = false;
        status.fps_actual = 0.0;
    }

    /// Latest published frame, or `None` when never captured or currently
    /// stopped. Never blocks the capture loop beyond the slot's pointer swap.
    pub fn get_frame(&self) -> Option<Arc<Frame>> {
        self.shared.slot.latest()
    }

    /// Apply a partial configuration update. A running stream is stopped
    /// first and restarted only if the resulting config is enabled; a restart
    /// failure is reported through status, not from this call. A stopped
    /// stream takes the fields directly.
    pub fn update_config(&self, patch: &SourceConfigPatch) {
        let mut state = lock_unpoisoned(&self.state);
        let was_running = self.shared.running.load(Ordering::SeqCst);
        if was_running {
            self.stop_locked(&mut state);
        }
        patch.apply_to(&mut state.config);
        if was_running && state.config.enabled {
            if let Err(err) = self.start_locked(&mut state) {
                log::warn!("restart of {} after reconfigure failed: {err:#}", self.id);
            }
        }
    }

    /// Point-in-time status copy.
    pub fn status(&self) -> SourceStatus {
        let mut status = lock_unpoisoned(&self.shared.status).clone();
        status.fps_actual = (status.fps_actual * 100.0).round() / 100.0;
        status
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            self.stop_locked(&mut state);
        }
    }
}

/// Rolling actual-FPS estimate over 1-second windows.
struct FpsWindow {
    frames: u32,
    since: Instant,
}

impl FpsWindow {
    fn new() -> Self {
        Self {
            frames: 0,
            since: Instant::now(),
        }
    }

    fn tick(&mut self) -> Option<f64> {
        self.frames += 1;
        let elapsed = self.since.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let fps = f64::from(self.frames) / elapsed.as_secs_f64();
            self.frames = 0;
            self.since = Instant::now();
            Some(fps)
        } else {
            None
        }
    }
}

/// Body of the capture thread. Owns the source handle; drops it on exit.
/// Blocks only on the source read and the rate-limiting sleep, never while
/// holding the slot lock.
fn capture_loop(shared: Arc<StreamShared>, config: SourceConfig, mut source: VideoSource) {
    let interval = config.frame_interval();
    let mut window = FpsWindow::new();

    while shared.running.load(Ordering::SeqCst) {
        let frame = match source.read() {
            Ok(frame) => frame,
            Err(err) => {
                // Transient: record and retry. Only a failed open is terminal.
                lock_unpoisoned(&shared.status).last_error = Some(format!("read failed: {err:#}"));
                std::thread::sleep(READ_RETRY_DELAY);
                continue;
            }
        };

        let frame = if frame.width != config.width || frame.height != config.height {
            match frame.resized(config.width, config.height) {
                Ok(frame) => frame,
                Err(err) => {
                    lock_unpoisoned(&shared.status).last_error =
                        Some(format!("resize failed: {err:#}"));
                    std::thread::sleep(READ_RETRY_DELAY);
                    continue;
                }
            }
        } else {
            frame
        };

        // Re-check the stop flag so a detached worker cannot publish into a
        // slot the owner already cleared.
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        shared.slot.publish(frame);

        {
            let mut status = lock_unpoisoned(&shared.status);
            status.frame_count += 1;
            if let Some(fps) = window.tick() {
                status.fps_actual = fps;
            }
        }

        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(id: &str, locator: &str) -> SourceConfig {
        SourceConfig {
            id: id.to_string(),
            name: format!("camera {id}"),
            locator: locator.to_string(),
            enabled: true,
            fps: 100,
            width: 64,
            height: 48,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn stop_before_start_is_safe() {
        let stream = CameraStream::new(stub_config("a", "stub://a"));
        stream.stop();
        stream.stop();
        let status = stream.status();
        assert!(!status.connected);
        assert_eq!(status.frame_count, 0);
        assert!(stream.get_frame().is_none());
    }

    #[test]
    fn start_is_idempotent() {
        let stream = CameraStream::new(stub_config("a", "stub://a"));
        stream.start().expect("first start");
        stream.start().expect("second start");
        assert!(stream.is_running());
        stream.stop();
        assert!(!stream.is_running());
    }

    #[test]
    fn failed_open_reports_disconnected_with_no_frame() {
        let stream = CameraStream::new(stub_config("a", "stub://a?offline"));
        assert!(stream.start().is_err());
        let status = stream.status();
        assert!(!status.connected);
        assert!(status.last_error.is_some());
        assert!(stream.get_frame().is_none());
        assert!(!stream.is_running());
    }

    #[test]
    fn capture_publishes_frames_and_counts_them() {
        let stream = CameraStream::new(stub_config("a", "stub://a"));
        stream.start().expect("start");
        assert!(wait_for(
            || stream.get_frame().is_some(),
            Duration::from_secs(2)
        ));

        let frame = stream.get_frame().expect("frame");
        assert_eq!((frame.width, frame.height), (64, 48));

        assert!(wait_for(
            || stream.status().frame_count >= 3,
            Duration::from_secs(2)
        ));
        stream.stop();

        let status = stream.status();
        assert!(!status.connected);
        assert!(status.frame_count >= 3);
        // A stopped stream holds no frame.
        assert!(stream.get_frame().is_none());
    }

    #[test]
    fn frames_are_resized_to_configured_dimensions() {
        let stream = CameraStream::new(stub_config("a", "stub://a?native=32x24"));
        stream.start().expect("start");
        assert!(wait_for(
            || stream.get_frame().is_some(),
            Duration::from_secs(2)
        ));
        let frame = stream.get_frame().expect("frame");
        assert_eq!((frame.width, frame.height), (64, 48));
        stream.stop();
    }

    #[test]
    fn read_failures_are_transient_and_recorded() {
        let stream = CameraStream::new(stub_config("a", "stub://a?flaky=3"));
        stream.start().expect("start");

        assert!(wait_for(
            || {
                let status = stream.status();
                status.last_error.is_some() && status.frame_count >= 3
            },
            Duration::from_secs(3)
        ));
        // The loop survived the failure and kept capturing.
        let status = stream.status();
        assert!(status.connected);
        assert!(status
            .last_error
            .as_deref()
            .unwrap_or("")
            .contains("read failed"));
        stream.stop();
    }

    #[test]
    fn fps_only_reconfigure_preserves_frame_count() {
        let stream = CameraStream::new(stub_config("a", "stub://a"));
        stream.start().expect("start");
        assert!(wait_for(
            || stream.status().frame_count >= 2,
            Duration::from_secs(2)
        ));

        let before = stream.status().frame_count;
        stream.update_config(&SourceConfigPatch {
            fps: Some(50),
            ..SourceConfigPatch::default()
        });

        assert!(stream.is_running());
        assert_eq!(stream.config().fps, 50);
        assert!(stream.status().frame_count >= before);
        stream.stop();
    }

    #[test]
    fn disabling_patch_stops_without_restart() {
        let stream = CameraStream::new(stub_config("a", "stub://a"));
        stream.start().expect("start");
        stream.update_config(&SourceConfigPatch {
            enabled: Some(false),
            ..SourceConfigPatch::default()
        });
        assert!(!stream.is_running());
        assert!(!stream.status().connected);
        assert!(!stream.config().enabled);
    }

    #[test]
    fn patch_on_stopped_stream_applies_directly() {
        let stream = CameraStream::new(stub_config("a", "stub://a"));
        stream.update_config(&SourceConfigPatch {
            width: Some(128),
            height: Some(96),
            name: Some("renamed".to_string()),
            ..SourceConfigPatch::default()
        });
        let config = stream.config();
        assert_eq!((config.width, config.height), (128, 96));
        assert_eq!(config.name, "renamed");
        assert!(!stream.is_running());
    }

    #[test]
    fn restart_failure_after_patch_lands_in_status() {
        let stream = CameraStream::new(stub_config("a", "stub://a"));
        stream.start().expect("start");
        stream.update_config(&SourceConfigPatch {
            locator: Some("stub://a?offline".to_string()),
            ..SourceConfigPatch::default()
        });
        assert!(!stream.is_running());
        let status = stream.status();
        assert!(!status.connected);
        assert!(status.last_error.is_some());
    }

    #[test]
    fn concurrent_readers_never_observe_torn_frames() {
        let stream = Arc::new(CameraStream::new(stub_config("a", "stub://a")));
        stream.start().expect("start");

        let mut readers = Vec::new();
        for _ in 0..4 {
            let stream = Arc::clone(&stream);
            readers.push(std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_millis(400);
                let mut seen = 0u64;
                while Instant::now() < deadline {
                    if let Some(frame) = stream.get_frame() {
                        // Each synthetic frame is a uniform fill; a torn
                        // buffer would mix bytes from two frames.
                        let first = frame.data[0];
                        assert!(
                            frame.data.iter().all(|&b| b == first),
                            "torn frame observed at seq {}",
                            frame.seq
                        );
                        seen += 1;
                    }
                }
                seen
            }));
        }

        let mut total = 0;
        for reader in readers {
            total += reader.join().expect("reader thread");
        }
        stream.stop();
        assert!(total > 0, "readers should have observed frames");
    }
}
