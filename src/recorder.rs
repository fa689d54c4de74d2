//! Per-source recording.
//!
//! A `Recorder` owns an open sink for one source while recording is active.
//! The built-in sink writes motion-JPEG: one JPEG per frame, back to back,
//! which common players accept directly. The artifact lives under
//! `<base_dir>/<source id>/<start timestamp>.mjpeg`.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::frame::Frame;
use crate::stream::SourceConfig;

/// The codec identifier the built-in sink understands.
pub const CODEC_MJPEG: &str = "mjpeg";

/// Concatenated-JPEG video sink.
#[derive(Debug)]
pub struct MjpegSink {
    writer: BufWriter<File>,
}

impl MjpegSink {
    /// Open a sink at `path`. Width, height and fps are the recording's
    /// nominal parameters; MJPEG carries them per frame, so they are
    /// accepted for the sink contract and validated against the codec only.
    pub fn create(path: &Path, _width: u32, _height: u32, _fps: u32, codec: &str) -> Result<Self> {
        if codec != CODEC_MJPEG {
            return Err(anyhow!("unsupported codec '{codec}' (only '{CODEC_MJPEG}')"));
        }
        let file = File::create(path)
            .with_context(|| format!("create recording file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        let jpeg = frame.to_jpeg()?;
        self.writer.write_all(&jpeg).context("write frame")?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush().context("flush recording")?;
        Ok(())
    }
}

/// Active recording for one source. Never outlives its stream's registration;
/// the registry force-stops it on removal and shutdown.
#[derive(Debug)]
pub struct Recorder {
    path: PathBuf,
    sink: MjpegSink,
    frames_written: u64,
}

impl Recorder {
    /// Open an artifact named by source id and start timestamp, bound to the
    /// source's currently configured dimensions and rate.
    pub fn create(base_dir: &Path, config: &SourceConfig, codec: &str) -> Result<Self> {
        let dir = base_dir.join(&config.id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create recording directory {}", dir.display()))?;
        let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = dir.join(format!("{timestamp}.mjpeg"));
        let sink = MjpegSink::create(&path, config.width, config.height, config.fps, codec)?;
        Ok(Self {
            path,
            sink,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        self.sink.write(frame)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        log::info!(
            "recording closed: {} ({} frames)",
            self.path.display(),
            self.frames_written
        );
        self.sink.finish()
    }
}
