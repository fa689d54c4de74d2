use std::time::{Duration, Instant};

use camgrid::frame::no_signal_placeholder;
use camgrid::{AppConfig, CameraManager, DisplaySettings, SourceConfig, SourceConfigPatch};

fn cam(id: &str, locator: &str, enabled: bool) -> SourceConfig {
    SourceConfig {
        id: id.to_string(),
        name: format!("camera {id}"),
        locator: locator.to_string(),
        enabled,
        fps: 100,
        width: 640,
        height: 480,
    }
}

fn manager_with(cameras: Vec<SourceConfig>, grid_cols: usize) -> CameraManager {
    let mut cfg = AppConfig::default();
    cfg.cameras = cameras;
    cfg.display = DisplaySettings { grid_cols };
    CameraManager::from_config(&cfg, None)
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
fn status_all_covers_every_registered_camera() {
    let manager = manager_with(
        vec![
            cam("a", "stub://a", true),
            cam("b", "stub://b?offline", true),
            cam("c", "stub://c", false),
        ],
        2,
    );
    manager.start_all();

    let statuses = manager.status_all();
    assert_eq!(statuses.len(), 3);
    // Registration order, not map order.
    assert_eq!(statuses[0].id, "a");
    assert_eq!(statuses[1].id, "b");
    assert_eq!(statuses[2].id, "c");

    assert!(wait_for(
        || manager.status("a").map(|s| s.connected).unwrap_or(false),
        Duration::from_secs(2)
    ));
    // Unreachable camera surfaces in status; nothing else is disturbed.
    let b = manager.status("b").expect("status b");
    assert!(!b.connected);
    assert!(b.last_error.is_some());
    let c = manager.status("c").expect("status c");
    assert!(!c.connected);

    manager.stop_all();
}

#[test]
fn per_id_operations_signal_unknown_ids_as_false() {
    let manager = manager_with(vec![cam("a", "stub://a", true)], 2);
    assert!(!manager.start("nope"));
    assert!(!manager.stop("nope"));
    assert!(!manager.reconfigure("nope", &SourceConfigPatch::default()));
    assert!(!manager.remove("nope"));
    assert!(!manager.start_recording("nope"));
    assert!(!manager.stop_recording("nope"));
    assert!(manager.status("nope").is_none());
    assert!(manager.snapshot("nope").is_none());
}

#[test]
fn duplicate_registration_is_rejected() {
    let manager = manager_with(vec![cam("a", "stub://a", true)], 2);
    assert!(!manager.register(cam("a", "stub://other", true)));
    assert_eq!(manager.status_all().len(), 1);
}

#[test]
fn grid_frame_is_none_only_with_no_cameras() {
    let manager = manager_with(Vec::new(), 2);
    assert!(manager.grid_frame().is_none());
}

#[test]
fn grid_of_unstarted_cameras_is_all_placeholders() {
    // 3 cameras, 2 columns -> 2 rows of 640x480 cells.
    let manager = manager_with(
        vec![
            cam("a", "stub://a", true),
            cam("b", "stub://b", true),
            cam("c", "stub://c", true),
        ],
        2,
    );
    let grid = manager.grid_frame().expect("grid");
    assert_eq!(grid.width, 1280);
    assert_eq!(grid.height, 960);
}

#[test]
fn grid_mixes_live_frames_and_placeholders() {
    // Scenario: A live at 640x480, B disabled. start_all starts only A.
    let manager = manager_with(
        vec![cam("a", "stub://a", true), cam("b", "stub://b", false)],
        2,
    );
    manager.start_all();

    assert!(wait_for(
        || manager.status("a").map(|s| s.frame_count > 0).unwrap_or(false),
        Duration::from_secs(2)
    ));
    let a = manager.status("a").expect("status a");
    assert!(a.connected);
    let b = manager.status("b").expect("status b");
    assert!(!b.connected);

    let grid = manager.grid_frame().expect("grid");
    assert_eq!(grid.width, 1280);
    assert_eq!(grid.height, 480);

    // A's half is a live synthetic frame: a uniform gray fill, equal RGB
    // channels. The placeholder's border is a saturated marker color.
    let a_pixel = &grid.data[0..3];
    assert!(a_pixel[0] == a_pixel[1] && a_pixel[1] == a_pixel[2]);

    // B's half is exactly the placeholder at B's configured dimensions.
    let expected = no_signal_placeholder(640, 480);
    let grid_row_bytes = 1280 * 3;
    let cell_row_bytes = 640 * 3;
    for row in 0..480 {
        let grid_start = row * grid_row_bytes + cell_row_bytes;
        let cell_start = row * cell_row_bytes;
        assert_eq!(
            &grid.data[grid_start..grid_start + cell_row_bytes],
            &expected.data[cell_start..cell_start + cell_row_bytes],
            "row {row} of the disabled camera's cell"
        );
    }

    manager.stop_all();
}

#[test]
fn remove_releases_stream_and_recorder() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = AppConfig::default();
    cfg.cameras = vec![cam("a", "stub://a", true)];
    cfg.output.base_dir = dir.path().to_path_buf();
    let manager = CameraManager::from_config(&cfg, None);

    manager.start_all();
    assert!(wait_for(
        || manager.status("a").map(|s| s.connected).unwrap_or(false),
        Duration::from_secs(2)
    ));
    assert!(manager.start_recording("a"));
    assert!(manager.is_recording("a"));

    assert!(manager.remove("a"));
    assert!(!manager.is_recording("a"));
    assert!(manager.status("a").is_none());
    assert!(manager.status_all().is_empty());
}

#[test]
fn reload_config_is_additive_and_keeps_existing_streams() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("camgrid.json");
    std::fs::write(
        &path,
        r#"{
            "cameras": [
                { "id": "a", "name": "a", "locator": "stub://a", "fps": 100, "width": 64, "height": 48 }
            ],
            "display": { "grid_cols": 2 }
        }"#,
    )
    .expect("write config");

    let cfg = AppConfig::load_from(&path).expect("load");
    let manager = CameraManager::from_config(&cfg, Some(path.clone()));
    manager.start_all();
    assert!(wait_for(
        || manager.status("a").map(|s| s.frame_count > 1).unwrap_or(false),
        Duration::from_secs(2)
    ));
    let count_before = manager.status("a").expect("status").frame_count;

    // New file adds "b" and changes the grid; "a" is unchanged.
    std::fs::write(
        &path,
        r#"{
            "cameras": [
                { "id": "a", "name": "a", "locator": "stub://a", "fps": 100, "width": 64, "height": 48 },
                { "id": "b", "name": "b", "locator": "stub://b", "fps": 100, "width": 64, "height": 48 }
            ],
            "display": { "grid_cols": 3 }
        }"#,
    )
    .expect("rewrite config");

    manager.reload_config().expect("reload");

    assert_eq!(manager.status_all().len(), 2);
    assert_eq!(manager.grid_cols(), 3);
    // The unchanged stream kept running; its counter never reset.
    assert!(manager.status("a").expect("status").frame_count >= count_before);
    assert!(wait_for(
        || manager.status("b").map(|s| s.connected).unwrap_or(false),
        Duration::from_secs(2)
    ));

    manager.stop_all();
}

#[test]
fn fps_reconfigure_through_manager_keeps_frame_count() {
    let manager = manager_with(vec![cam("a", "stub://a", true)], 2);
    manager.start_all();
    assert!(wait_for(
        || manager.status("a").map(|s| s.frame_count > 1).unwrap_or(false),
        Duration::from_secs(2)
    ));
    let before = manager.status("a").expect("status").frame_count;

    assert!(manager.reconfigure(
        "a",
        &SourceConfigPatch {
            fps: Some(50),
            ..SourceConfigPatch::default()
        }
    ));
    assert!(manager.status("a").expect("status").frame_count >= before);
    manager.stop_all();
}
