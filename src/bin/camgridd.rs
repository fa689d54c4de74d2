//! camgridd - multi-camera orchestration daemon.
//!
//! Loads the camera configuration, starts every enabled stream, serves the
//! HTTP control surface, and drives active recorders from a fixed tick loop
//! until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camgrid::api::{ApiConfig, ApiServer};
use camgrid::{AppConfig, CameraManager};

const TICK_INTERVAL: Duration = Duration::from_millis(33);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "camgridd",
    about = "Multi-camera stream orchestration daemon",
    version
)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "camgrid.json", env = "CAMGRID_CONFIG")]
    config: PathBuf,
    /// Run without the HTTP control API.
    #[arg(long)]
    no_api: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = AppConfig::load_from(&args.config)?;
    let manager = Arc::new(CameraManager::from_config(&cfg, Some(args.config.clone())));

    log::info!(
        "camgridd starting: {} cameras configured, grid_cols={}, output={}",
        cfg.cameras.len(),
        cfg.display.grid_cols,
        cfg.output.base_dir.display()
    );
    manager.start_all();

    let api_handle = if args.no_api {
        None
    } else {
        let api = ApiServer::new(
            ApiConfig {
                addr: cfg.api.addr.clone(),
            },
            Arc::clone(&manager),
        )
        .spawn()?;
        log::info!("control api listening on {}", api.addr);
        Some(api)
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("install signal handler")?;
    }

    let mut last_health_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        manager.write_tick();

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            for status in manager.status_all() {
                let error = status
                    .last_error
                    .as_deref()
                    .map(|e| format!(" last_error={e:?}"))
                    .unwrap_or_default();
                log::info!(
                    "{}: connected={} fps={:.1} frames={}{}",
                    status.id,
                    status.connected,
                    status.fps_actual,
                    status.frame_count,
                    error
                );
            }
            last_health_log = Instant::now();
        }

        std::thread::sleep(TICK_INTERVAL);
    }

    log::info!("shutting down");
    if let Some(api) = api_handle {
        api.stop()?;
    }
    manager.stop_all();
    Ok(())
}
