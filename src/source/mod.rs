//! Video source access.
//!
//! `VideoSource` turns a source locator into a stream of decoded frames:
//! - `stub://name`: synthetic source, always available. Used by tests and
//!   demos. Query parameters tune its behavior: `offline` makes `open` fail,
//!   `native=WxH` emits frames at a size other than the requested one (to
//!   exercise the resize path), `flaky=N` fails every Nth read.
//! - `rtsp://…`, other URIs, and V4L2 device locators (`0`, `/dev/video0`)
//!   require the `source-gstreamer` feature.
//!
//! Sources produce complete RGB8 frames; the capture handle is released when
//! the `VideoSource` is dropped.

use anyhow::{anyhow, Result};

use crate::frame::Frame;

#[cfg(feature = "source-gstreamer")]
mod gst;

/// Capture hints applied when opening a source. Real backends install these
/// as caps; the synthetic backend sizes its frames from them.
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

/// One open video source.
#[derive(Debug)]
pub struct VideoSource {
    backend: SourceBackend,
}

#[derive(Debug)]
enum SourceBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "source-gstreamer")]
    Gstreamer(gst::GstreamerSource),
}

impl VideoSource {
    /// Open `locator`. Fails with a descriptive error when the source is
    /// unreachable or the locator scheme is not supported by this build.
    pub fn open(locator: &str, options: &CaptureOptions) -> Result<Self> {
        if locator.starts_with("stub://") {
            return Ok(Self {
                backend: SourceBackend::Synthetic(SyntheticSource::open(locator, options)?),
            });
        }
        #[cfg(feature = "source-gstreamer")]
        {
            Ok(Self {
                backend: SourceBackend::Gstreamer(gst::GstreamerSource::open(locator, options)?),
            })
        }
        #[cfg(not(feature = "source-gstreamer"))]
        {
            Err(anyhow!(
                "cannot open source '{locator}': this build supports stub:// locators only \
                 (enable the source-gstreamer feature for RTSP/URI/device capture)"
            ))
        }
    }

    /// Read the next frame. A failure here is transient from the caller's
    /// point of view; the capture loop retries.
    pub fn read(&mut self) -> Result<Frame> {
        match &mut self.backend {
            SourceBackend::Synthetic(source) => source.read(),
            #[cfg(feature = "source-gstreamer")]
            SourceBackend::Gstreamer(source) => source.read(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct SyntheticSource {
    width: u32,
    height: u32,
    seq: u64,
    fail_every: Option<u64>,
}

impl SyntheticSource {
    fn open(locator: &str, options: &CaptureOptions) -> Result<Self> {
        let query = locator.split_once('?').map(|(_, q)| q).unwrap_or("");
        let mut width = options.width;
        let mut height = options.height;
        let mut fail_every = None;
        for param in query.split('&').filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                None if param == "offline" => {
                    return Err(anyhow!("cannot open source '{locator}': marked offline"));
                }
                Some(("native", value)) => {
                    let (w, h) = value
                        .split_once('x')
                        .ok_or_else(|| anyhow!("stub native size must be WxH, got '{value}'"))?;
                    width = w.parse()?;
                    height = h.parse()?;
                }
                Some(("flaky", value)) => {
                    fail_every = Some(value.parse()?);
                }
                _ => {}
            }
        }
        Ok(Self {
            width: width.max(1),
            height: height.max(1),
            seq: 0,
            fail_every,
        })
    }

    fn read(&mut self) -> Result<Frame> {
        self.seq += 1;
        if let Some(n) = self.fail_every {
            if n > 0 && self.seq % n == 0 {
                return Err(anyhow!("synthetic read failure (frame {})", self.seq));
            }
        }
        // Every frame is a single recognizable byte so readers can detect a
        // torn buffer: a whole frame is uniform, a mix of two frames is not.
        let fill = (self.seq % 256) as u8;
        Ok(Frame::solid([fill, fill, fill], self.width, self.height, self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CaptureOptions {
        CaptureOptions {
            width: 64,
            height: 48,
            target_fps: 30,
        }
    }

    #[test]
    fn stub_source_produces_uniform_frames() {
        let mut source = VideoSource::open("stub://cam", &options()).expect("open");
        let first = source.read().expect("frame");
        assert_eq!(first.width, 64);
        assert_eq!(first.height, 48);
        assert_eq!(first.seq, 1);
        assert!(first.data.iter().all(|&b| b == first.data[0]));

        let second = source.read().expect("frame");
        assert_eq!(second.seq, 2);
        assert_ne!(first.data[0], second.data[0]);
    }

    #[test]
    fn offline_stub_fails_to_open() {
        let err = VideoSource::open("stub://cam?offline", &options()).unwrap_err();
        assert!(err.to_string().contains("offline"));
    }

    #[test]
    fn native_size_overrides_requested_dimensions() {
        let mut source = VideoSource::open("stub://cam?native=320x240", &options()).expect("open");
        let frame = source.read().expect("frame");
        assert_eq!((frame.width, frame.height), (320, 240));
    }

    #[test]
    fn flaky_stub_fails_every_nth_read() {
        let mut source = VideoSource::open("stub://cam?flaky=2", &options()).expect("open");
        assert!(source.read().is_ok());
        assert!(source.read().is_err());
        assert!(source.read().is_ok());
        assert!(source.read().is_err());
    }

    #[cfg(not(feature = "source-gstreamer"))]
    #[test]
    fn non_stub_locator_fails_without_gstreamer() {
        let err = VideoSource::open("rtsp://camera.local/stream", &options()).unwrap_err();
        assert!(err.to_string().contains("source-gstreamer"));
    }
}
