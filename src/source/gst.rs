//! GStreamer capture backend (feature `source-gstreamer`).
//!
//! Builds a decode pipeline per locator kind and pulls RGB frames through an
//! appsink. The appsink keeps at most one buffer and drops older ones, so a
//! stalled consumer reads the freshest frame rather than a backlog.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use super::CaptureOptions;
use crate::frame::Frame;

#[derive(Debug)]
pub(super) struct GstreamerSource {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    locator: String,
    target_fps: u32,
    seq: u64,
}

impl GstreamerSource {
    pub(super) fn open(locator: &str, options: &CaptureOptions) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = pipeline_description(locator, options)?;
        let pipeline = gstreamer::parse::launch(&description)
            .with_context(|| format!("build capture pipeline for '{locator}'"))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline for '{locator}' is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start capture pipeline for '{locator}'"))?;
        log::info!("source opened: {locator}");

        Ok(Self {
            pipeline,
            appsink,
            locator: locator.to_string(),
            target_fps: options.target_fps,
            seq: 0,
        })
    }

    pub(super) fn read(&mut self) -> Result<Frame> {
        self.check_bus()?;

        let sample = self
            .appsink
            .try_pull_sample(self.frame_timeout())
            .ok_or_else(|| anyhow!("stream '{}' stalled", self.locator))?;

        let (data, width, height) = sample_to_rgb(&sample)?;
        self.seq += 1;
        Frame::new(data, width, height, self.seq)
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.target_fps == 0 {
            500
        } else {
            (1000 / self.target_fps).saturating_mul(4)
        };
        gstreamer::ClockTime::from_mseconds(u64::from(base_ms.max(500)))
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "pipeline error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    return Err(anyhow!("stream '{}' reached end of stream", self.locator));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to tear down pipeline for {}: {err}", self.locator);
        }
    }
}

/// Locator kinds: RTSP URLs get rtspsrc, V4L2 devices get v4l2src, anything
/// else goes through uridecodebin. All converge on a scaled, rate-capped RGB
/// appsink.
fn pipeline_description(locator: &str, options: &CaptureOptions) -> Result<String> {
    let head = if locator.starts_with("rtsp://") {
        format!("rtspsrc location={locator} latency=0 ! decodebin")
    } else if let Some(device) = device_path(locator) {
        format!("v4l2src device={device} ! decodebin")
    } else if locator.contains("://") {
        format!("uridecodebin uri={locator}")
    } else {
        return Err(anyhow!("unrecognized source locator '{locator}'"));
    };
    let fps = options.target_fps.max(1);
    Ok(format!(
        "{head} ! videoconvert ! videoscale ! videorate ! \
         video/x-raw,format=RGB,width={},height={},framerate={fps}/1 ! \
         appsink name=appsink sync=false max-buffers=1 drop=true",
        options.width, options.height
    ))
}

fn device_path(locator: &str) -> Option<String> {
    if locator.starts_with("/dev/") {
        return Some(locator.to_string());
    }
    locator
        .parse::<u32>()
        .ok()
        .map(|index| format!("/dev/video{index}"))
}

fn sample_to_rgb(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride(0) as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row out of bounds")?);
    }
    Ok((pixels, width, height))
}
