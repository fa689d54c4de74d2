//! HTTP control surface.
//!
//! A small HTTP/1.1 server over `std::net::TcpListener`, one thread per
//! connection, with a cooperative shutdown flag. It holds an explicit
//! `Arc<CameraManager>` passed at construction; there is no process-wide
//! manager. Unknown camera ids map to 404; a camera that exists but is
//! disconnected still answers with its status, so the two cases stay
//! distinguishable. The surface carries no authentication.
//!
//! Routes:
//! - `GET  /health`
//! - `GET  /api/status`: all camera snapshots
//! - `GET  /api/cameras/{id}`: one snapshot
//! - `POST /api/cameras/{id}/config`: partial config update (JSON body)
//! - `POST /api/cameras/{id}/start` / `stop`
//! - `POST /api/cameras/{id}/record/start` / `record/stop`
//! - `POST /api/reload`
//! - `GET  /api/grid`: one JPEG grid frame
//! - `GET  /api/stream/grid`: multipart MJPEG grid stream

use anyhow::{anyhow, Result};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::manager::CameraManager;
use crate::stream::SourceConfigPatch;

const MAX_REQUEST_BYTES: usize = 65536;
/// Cadence of the multipart grid stream.
const STREAM_FRAME_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8700".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    manager: Arc<CameraManager>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, manager: Arc<CameraManager>) -> Self {
        Self { cfg, manager }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let manager = self.manager;
        let join = std::thread::spawn(move || {
            run_api(listener, manager, shutdown_thread);
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, manager: Arc<CameraManager>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                // One thread per connection: a long-lived MJPEG stream must
                // not block control requests.
                let manager = Arc::clone(&manager);
                let shutdown = Arc::clone(&shutdown);
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &manager, &shutdown) {
                        log::warn!("api request failed: {err:#}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                log::error!("api accept failed: {err}");
                break;
            }
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    manager: &CameraManager,
    shutdown: &AtomicBool,
) -> Result<()> {
    let request = read_request(&mut stream)?;
    let segments: Vec<&str> = request
        .path
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", ["api", "status"]) => {
            let payload = serde_json::to_vec(&json!({ "cameras": manager.snapshots() }))?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        ("GET", ["api", "cameras", id]) => match manager.snapshot(id) {
            Some(snapshot) => {
                let payload = serde_json::to_vec(&snapshot)?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            None => write_json_response(&mut stream, 404, r#"{"error":"camera_not_found"}"#),
        },
        ("POST", ["api", "cameras", id, "config"]) => {
            let patch: SourceConfigPatch = match serde_json::from_slice(&request.body) {
                Ok(patch) => patch,
                Err(_) => {
                    return write_json_response(&mut stream, 400, r#"{"error":"invalid_body"}"#)
                }
            };
            if patch.is_empty() {
                return write_json_response(&mut stream, 400, r#"{"error":"empty_patch"}"#);
            }
            if manager.reconfigure(id, &patch) {
                write_ok(&mut stream, &format!("camera {id} config updated"))
            } else {
                write_json_response(&mut stream, 404, r#"{"error":"camera_not_found"}"#)
            }
        }
        ("POST", ["api", "cameras", id, "start"]) => {
            if manager.status(id).is_none() {
                write_json_response(&mut stream, 404, r#"{"error":"camera_not_found"}"#)
            } else if manager.start(id) {
                write_ok(&mut stream, &format!("camera {id} started"))
            } else {
                write_json_response(&mut stream, 503, r#"{"error":"start_failed"}"#)
            }
        }
        ("POST", ["api", "cameras", id, "stop"]) => {
            if manager.stop(id) {
                write_ok(&mut stream, &format!("camera {id} stopped"))
            } else {
                write_json_response(&mut stream, 404, r#"{"error":"camera_not_found"}"#)
            }
        }
        ("POST", ["api", "cameras", id, "record", "start"]) => {
            if manager.status(id).is_none() {
                write_json_response(&mut stream, 404, r#"{"error":"camera_not_found"}"#)
            } else if manager.start_recording(id) {
                write_ok(&mut stream, &format!("recording started for {id}"))
            } else {
                write_json_response(&mut stream, 500, r#"{"error":"recording_failed"}"#)
            }
        }
        ("POST", ["api", "cameras", id, "record", "stop"]) => {
            if manager.stop_recording(id) {
                write_ok(&mut stream, &format!("recording stopped for {id}"))
            } else {
                write_json_response(&mut stream, 404, r#"{"error":"not_recording"}"#)
            }
        }
        ("POST", ["api", "reload"]) => match manager.reload_config() {
            Ok(()) => write_ok(&mut stream, "configuration reloaded"),
            Err(err) => {
                let payload = serde_json::to_vec(&json!({
                    "error": "reload_failed",
                    "message": format!("{err:#}"),
                }))?;
                write_response(&mut stream, 500, "application/json", &payload)
            }
        },
        ("GET", ["api", "grid"]) => match manager.grid_frame() {
            Some(frame) => {
                let jpeg = frame.to_jpeg()?;
                write_response(&mut stream, 200, "image/jpeg", &jpeg)
            }
            None => write_json_response(&mut stream, 503, r#"{"error":"no_cameras"}"#),
        },
        ("GET", ["api", "stream", "grid"]) => stream_grid(&mut stream, manager, shutdown),
        ("GET", _) | ("POST", _) => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)
        }
        _ => write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#),
    }
}

/// Multipart MJPEG stream of grid frames. Runs until the client disconnects
/// or the server shuts down.
fn stream_grid(stream: &mut TcpStream, manager: &CameraManager, shutdown: &AtomicBool) -> Result<()> {
    let header = "HTTP/1.1 200 OK\r\n\
                  Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
                  Cache-Control: no-store\r\n\
                  Connection: close\r\n\r\n";
    stream.write_all(header.as_bytes())?;

    while !shutdown.load(Ordering::SeqCst) {
        if let Some(frame) = manager.grid_frame() {
            let jpeg = frame.to_jpeg()?;
            let part = format!(
                "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                jpeg.len()
            );
            let sent = stream
                .write_all(part.as_bytes())
                .and_then(|()| stream.write_all(&jpeg))
                .and_then(|()| stream.write_all(b"\r\n"));
            if sent.is_err() {
                break;
            }
        }
        std::thread::sleep(STREAM_FRAME_INTERVAL);
    }
    Ok(())
}

fn write_ok(stream: &mut TcpStream, message: &str) -> Result<()> {
    let payload = serde_json::to_vec(&json!({ "status": "ok", "message": message }))?;
    write_response(stream, 200, "application/json", &payload)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("truncated request"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[(header_end + 4).min(data.len())..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
