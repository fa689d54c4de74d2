//! Camera registry and orchestration.
//!
//! The `CameraManager` owns the set of streams keyed by source id, in
//! registration order, plus an optional recorder per source. It never touches
//! source I/O itself: capture runs in each stream's own thread, and the
//! manager only reads published state and issues short start/stop/reconfigure
//! commands. Registry and recorder maps have their own locks, independent of
//! any stream's internals, and are held only long enough to look up an `Arc`,
//! so a degraded source cannot stall registry-wide operations.
//!
//! Every per-id operation reports "unknown id" as `false`/`None`; no error in
//! one stream propagates to another or aborts an aggregate operation.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{AppConfig, DisplaySettings, OutputSettings};
use crate::frame::{compose_grid, no_signal_placeholder, Frame};
use crate::lock_unpoisoned;
use crate::recorder::Recorder;
use crate::stream::{CameraStream, SourceConfig, SourceConfigPatch, SourceStatus};

/// Config plus status for one camera, as exposed on the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct CameraSnapshot {
    pub config: SourceConfig,
    pub status: SourceStatus,
}

struct ViewSettings {
    display: DisplaySettings,
    output: OutputSettings,
}

pub struct CameraManager {
    streams: Mutex<Vec<Arc<CameraStream>>>,
    recorders: Mutex<HashMap<String, Recorder>>,
    settings: Mutex<ViewSettings>,
    config_path: Option<PathBuf>,
}

impl CameraManager {
    pub fn new(display: DisplaySettings, output: OutputSettings) -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            recorders: Mutex::new(HashMap::new()),
            settings: Mutex::new(ViewSettings { display, output }),
            config_path: None,
        }
    }

    /// Build a manager from a loaded configuration and register its cameras.
    /// `config_path` enables [`CameraManager::reload_config`].
    pub fn from_config(config: &AppConfig, config_path: Option<PathBuf>) -> Self {
        let mut manager = Self::new(config.display.clone(), config.output.clone());
        manager.config_path = config_path;
        for camera in &config.cameras {
            manager.register(camera.clone());
        }
        manager
    }

    /// Add a stream for `config`. Returns false when the id is already taken.
    pub fn register(&self, config: SourceConfig) -> bool {
        let mut streams = lock_unpoisoned(&self.streams);
        if streams.iter().any(|stream| stream.id() == config.id) {
            log::warn!("camera id '{}' already registered", config.id);
            return false;
        }
        log::info!("registered camera {} ({})", config.id, config.locator);
        streams.push(Arc::new(CameraStream::new(config)));
        true
    }

    /// Stop any recorder for `id`, stop the stream, and deregister it.
    pub fn remove(&self, id: &str) -> bool {
        let Some(stream) = self.stream(id) else {
            return false;
        };
        // The recorder must not outlive the stream's registration.
        if let Some(recorder) = lock_unpoisoned(&self.recorders).remove(id) {
            if let Err(err) = recorder.finish() {
                log::warn!("closing recorder for {id} failed: {err:#}");
            }
        }
        stream.stop();
        let mut streams = lock_unpoisoned(&self.streams);
        streams.retain(|stream| stream.id() != id);
        log::info!("removed camera {id}");
        true
    }

    fn stream(&self, id: &str) -> Option<Arc<CameraStream>> {
        lock_unpoisoned(&self.streams)
            .iter()
            .find(|stream| stream.id() == id)
            .cloned()
    }

    fn streams_snapshot(&self) -> Vec<Arc<CameraStream>> {
        lock_unpoisoned(&self.streams).clone()
    }

    /// Start every enabled stream. Failures are logged and reflected in the
    /// failing stream's status; the rest start regardless.
    pub fn start_all(&self) {
        for stream in self.streams_snapshot() {
            if !stream.config().enabled {
                continue;
            }
            if let Err(err) = stream.start() {
                log::warn!("camera {} failed to start: {err:#}", stream.id());
            }
        }
    }

    /// Stop every recorder, then every stream.
    pub fn stop_all(&self) {
        let recorders: Vec<(String, Recorder)> =
            lock_unpoisoned(&self.recorders).drain().collect();
        for (id, recorder) in recorders {
            if let Err(err) = recorder.finish() {
                log::warn!("closing recorder for {id} failed: {err:#}");
            }
        }
        for stream in self.streams_snapshot() {
            stream.stop();
        }
    }

    /// Start one stream. False for an unknown id, and for an open failure;
    /// `status(id)` carries the detail in the latter case.
    pub fn start(&self, id: &str) -> bool {
        match self.stream(id) {
            Some(stream) => stream.start().is_ok(),
            None => false,
        }
    }

    pub fn stop(&self, id: &str) -> bool {
        match self.stream(id) {
            Some(stream) => {
                stream.stop();
                true
            }
            None => false,
        }
    }

    /// Apply a partial config update to one stream (stop, mutate, restart if
    /// enabled). False for an unknown id.
    pub fn reconfigure(&self, id: &str, patch: &SourceConfigPatch) -> bool {
        match self.stream(id) {
            Some(stream) => {
                stream.update_config(patch);
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> Option<SourceStatus> {
        self.stream(id).map(|stream| stream.status())
    }

    /// Status of every registered stream, in registration order, regardless
    /// of how many are connected.
    pub fn status_all(&self) -> Vec<SourceStatus> {
        self.streams_snapshot()
            .iter()
            .map(|stream| stream.status())
            .collect()
    }

    pub fn snapshot(&self, id: &str) -> Option<CameraSnapshot> {
        self.stream(id).map(|stream| CameraSnapshot {
            config: stream.config(),
            status: stream.status(),
        })
    }

    pub fn snapshots(&self) -> Vec<CameraSnapshot> {
        self.streams_snapshot()
            .iter()
            .map(|stream| CameraSnapshot {
                config: stream.config(),
                status: stream.status(),
            })
            .collect()
    }

    /// Composite of every stream's latest frame, row-major with the
    /// configured column count. Streams with no frame contribute a
    /// placeholder at their configured dimensions, so the grid shape is
    /// stable under partial failure. `None` only when nothing is registered.
    pub fn grid_frame(&self) -> Option<Frame> {
        let streams = self.streams_snapshot();
        if streams.is_empty() {
            return None;
        }
        let cols = lock_unpoisoned(&self.settings).display.grid_cols;
        let cells: Vec<Arc<Frame>> = streams
            .iter()
            .map(|stream| {
                stream.get_frame().unwrap_or_else(|| {
                    let config = stream.config();
                    Arc::new(no_signal_placeholder(config.width, config.height))
                })
            })
            .collect();
        compose_grid(&cells, cols)
    }

    pub fn grid_cols(&self) -> usize {
        lock_unpoisoned(&self.settings).display.grid_cols
    }

    /// Re-read the config file this manager was built from and apply it
    /// additively: unknown ids are registered (and started when enabled),
    /// existing ids are reconfigured when their fields changed, and ids
    /// missing from the new file are left untouched.
    pub fn reload_config(&self) -> Result<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| anyhow!("manager was not built from a config file"))?;
        let config = AppConfig::load_from(path)?;
        self.apply_config(&config);
        log::info!("configuration reloaded from {}", path.display());
        Ok(())
    }

    fn apply_config(&self, config: &AppConfig) {
        {
            let mut settings = lock_unpoisoned(&self.settings);
            settings.display = config.display.clone();
            settings.output = config.output.clone();
        }
        for camera in &config.cameras {
            match self.stream(&camera.id) {
                None => {
                    let enabled = camera.enabled;
                    let id = camera.id.clone();
                    if self.register(camera.clone()) && enabled && !self.start(&id) {
                        log::warn!("newly configured camera {id} failed to start");
                    }
                }
                Some(stream) => {
                    let current = stream.config();
                    if current != *camera {
                        stream.update_config(&full_patch(camera));
                    }
                }
            }
        }
    }

    /// True when a recorder is active for `id`.
    pub fn is_recording(&self, id: &str) -> bool {
        lock_unpoisoned(&self.recorders).contains_key(id)
    }

    /// Open a recorder bound to the stream's current configured dimensions
    /// and rate. False for an unknown id or a sink that cannot be opened;
    /// calling while already recording is a no-op returning true.
    pub fn start_recording(&self, id: &str) -> bool {
        let Some(stream) = self.stream(id) else {
            return false;
        };
        let mut recorders = lock_unpoisoned(&self.recorders);
        if recorders.contains_key(id) {
            return true;
        }
        let config = stream.config();
        let (base_dir, codec) = {
            let settings = lock_unpoisoned(&self.settings);
            (
                settings.output.base_dir.clone(),
                settings.output.codec.clone(),
            )
        };
        match Recorder::create(&base_dir, &config, &codec) {
            Ok(recorder) => {
                log::info!("recording {} to {}", id, recorder.path().display());
                recorders.insert(id.to_string(), recorder);
                true
            }
            Err(err) => {
                log::error!("cannot start recording {id}: {err:#}");
                false
            }
        }
    }

    /// Close and release the recorder for `id`. False when not recording.
    pub fn stop_recording(&self, id: &str) -> bool {
        let Some(recorder) = lock_unpoisoned(&self.recorders).remove(id) else {
            return false;
        };
        if let Err(err) = recorder.finish() {
            log::warn!("closing recorder for {id} failed: {err:#}");
        }
        true
    }

    /// Append the latest frame of every recorded source to its artifact. A
    /// source with no frame available is skipped; a write failure is logged
    /// and does not disturb the other recorders.
    pub fn write_tick(&self) {
        let mut recorders = lock_unpoisoned(&self.recorders);
        for (id, recorder) in recorders.iter_mut() {
            let Some(frame) = self.stream(id).and_then(|stream| stream.get_frame()) else {
                continue;
            };
            if let Err(err) = recorder.write(&frame) {
                log::warn!("recording write for {id} failed: {err:#}");
            }
        }
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// A patch carrying every mutable field of `config`, for reload-time
/// reconfiguration of an existing stream.
fn full_patch(config: &SourceConfig) -> SourceConfigPatch {
    SourceConfigPatch {
        name: Some(config.name.clone()),
        locator: Some(config.locator.clone()),
        enabled: Some(config.enabled),
        fps: Some(config.fps),
        width: Some(config.width),
        height: Some(config.height),
    }
}
