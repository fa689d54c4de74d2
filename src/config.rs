//! Application configuration.
//!
//! Loaded from a JSON file, with environment overrides for deploy-time knobs:
//! `CAMGRID_API_ADDR`, `CAMGRID_OUTPUT_DIR`, `CAMGRID_GRID_COLS`.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::recorder::CODEC_MJPEG;
use crate::stream::SourceConfig;

const DEFAULT_GRID_COLS: usize = 2;
const DEFAULT_OUTPUT_DIR: &str = "output";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8700";

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    cameras: Option<Vec<SourceConfig>>,
    display: Option<DisplayConfigFile>,
    output: Option<OutputConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    grid_cols: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    base_dir: Option<PathBuf>,
    codec: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cameras: Vec<SourceConfig>,
    pub display: DisplaySettings,
    pub output: OutputSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone)]
pub struct DisplaySettings {
    /// Number of grid columns in the composited view.
    pub grid_cols: usize,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Recordings land under `<base_dir>/<source id>/`.
    pub base_dir: PathBuf,
    pub codec: String,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            display: DisplaySettings {
                grid_cols: DEFAULT_GRID_COLS,
            },
            output: OutputSettings {
                base_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
                codec: CODEC_MJPEG.to_string(),
            },
            api: ApiSettings {
                addr: DEFAULT_API_ADDR.to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Read `path`, apply environment overrides, validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let file_cfg = read_config_file(path)?;
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            cameras: file.cameras.unwrap_or_default(),
            display: DisplaySettings {
                grid_cols: file
                    .display
                    .and_then(|display| display.grid_cols)
                    .unwrap_or(defaults.display.grid_cols),
            },
            output: OutputSettings {
                base_dir: file
                    .output
                    .as_ref()
                    .and_then(|output| output.base_dir.clone())
                    .unwrap_or(defaults.output.base_dir),
                codec: file
                    .output
                    .and_then(|output| output.codec)
                    .unwrap_or(defaults.output.codec),
            },
            api: ApiSettings {
                addr: file
                    .api
                    .and_then(|api| api.addr)
                    .unwrap_or(defaults.api.addr),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMGRID_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("CAMGRID_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output.base_dir = PathBuf::from(dir);
            }
        }
        if let Ok(cols) = std::env::var("CAMGRID_GRID_COLS") {
            let cols: usize = cols
                .parse()
                .map_err(|_| anyhow!("CAMGRID_GRID_COLS must be a positive integer"))?;
            self.display.grid_cols = cols;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.display.grid_cols == 0 {
            return Err(anyhow!("display.grid_cols must be at least 1"));
        }
        if self.output.codec != CODEC_MJPEG {
            return Err(anyhow!(
                "output.codec '{}' is not supported (only '{CODEC_MJPEG}')",
                self.output.codec
            ));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(anyhow!("camera id must not be empty"));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
            if camera.width == 0 || camera.height == 0 {
                return Err(anyhow!("camera '{}' has zero dimensions", camera.id));
            }
            if camera.fps == 0 {
                return Err(anyhow!("camera '{}' has zero target fps", camera.id));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.display.grid_cols, 2);
        assert_eq!(cfg.output.codec, CODEC_MJPEG);
    }

    #[test]
    fn duplicate_camera_ids_are_rejected() {
        let mut cfg = AppConfig::default();
        let camera = SourceConfig {
            id: "a".to_string(),
            name: "a".to_string(),
            locator: "stub://a".to_string(),
            enabled: true,
            fps: 30,
            width: 640,
            height: 480,
        };
        cfg.cameras.push(camera.clone());
        cfg.cameras.push(camera);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.output.codec = "h264".to_string();
        assert!(cfg.validate().is_err());
    }
}
