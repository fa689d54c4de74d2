//! camgrid: multi-camera stream orchestration.
//!
//! The core owns zero or more independently-failing video sources. Each
//! source gets its own capture thread that publishes its newest frame into a
//! per-stream slot; a registry composes grid views across sources, drives
//! optional per-source recorders, and applies live reconfiguration to one
//! source without disturbing the others.
//!
//! # Module structure
//!
//! - `frame`: frame type, the single-writer/multi-reader frame slot, grid
//!   composition and placeholders
//! - `source`: video source access (synthetic `stub://` backend; GStreamer
//!   behind the `source-gstreamer` feature)
//! - `stream`: one source bound to its capture loop and status
//! - `manager`: the registry; start/stop/reconfigure, status aggregation,
//!   grid composition, recording control
//! - `recorder`: per-source MJPEG recording
//! - `config`: JSON configuration with environment overrides
//! - `api`: HTTP control surface over a manager

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api;
pub mod config;
pub mod frame;
pub mod manager;
pub mod recorder;
pub mod source;
pub mod stream;

pub use config::{ApiSettings, AppConfig, DisplaySettings, OutputSettings};
pub use frame::{compose_grid, no_signal_placeholder, Frame, FrameSlot};
pub use manager::{CameraManager, CameraSnapshot};
pub use recorder::{MjpegSink, Recorder, CODEC_MJPEG};
pub use source::{CaptureOptions, VideoSource};
pub use stream::{CameraStream, SourceConfig, SourceConfigPatch, SourceStatus};

/// A capture thread that panicked must not poison the slot and status locks
/// its readers depend on; recover the guard and keep serving.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
