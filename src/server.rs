//! Web server for monitoring a running acquisition

use anyhow::Result;
use arc_swap::ArcSwap;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use image::{GrayImage, Luma, RgbImage};
use parking_lot::RwLock;
use rust_embed::RustEmbed;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::acquisition::{AcquisitionError, AcquisitionObserver, GrayFrame};
use crate::archive::TransportArchive;
use crate::transport::{LevelOutcome, TransportMatrix};

/// Embedded static files for the web UI
#[derive(RustEmbed)]
#[folder = "static/"]
struct StaticAssets;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Prime,
    Capturing,
    Finished,
    Failed,
}

/// Progress snapshot served by `/api/status`
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionStatus {
    pub phase: Phase,
    pub level: Option<usize>,
    /// Groups scheduled for the current level
    pub groups: usize,
    /// Groups captured so far in the current level
    pub groups_done: usize,
    pub blocks: usize,
    pub transport_entries: usize,
    pub subdivided: usize,
    pub dormant_pixels: usize,
    pub frames_captured: u64,
    pub error: Option<String>,
    pub elapsed_secs: f64,
}

/// Shared monitor state, fed by the acquisition thread
pub struct MonitorState {
    status: RwLock<AcquisitionStatus>,
    started: Instant,
    /// Latest captured frame (JPEG encoded)
    frame: ArcSwap<Vec<u8>>,
    /// Prime image (JPEG encoded)
    prime: ArcSwap<Vec<u8>>,
    camera: (u32, u32),
    projector: (u32, u32),
    max_depth: usize,
}

impl MonitorState {
    pub fn new(camera: (u32, u32), projector: (u32, u32), max_depth: usize) -> Self {
        Self {
            status: RwLock::new(AcquisitionStatus::default()),
            started: Instant::now(),
            frame: ArcSwap::from_pointee(Vec::new()),
            prime: ArcSwap::from_pointee(Vec::new()),
            camera,
            projector,
            max_depth,
        }
    }

    pub fn status(&self) -> AcquisitionStatus {
        let mut status = self.status.read().clone();
        status.elapsed_secs = self.started.elapsed().as_secs_f64();
        status
    }

    /// Get the latest captured frame
    pub fn latest_frame(&self) -> Arc<Vec<u8>> {
        let frame = self.frame.load_full();
        if frame.is_empty() {
            return self.prime.load_full();
        }
        frame
    }
}

impl AcquisitionObserver for MonitorState {
    fn prime_captured(&self, image: &RgbImage) {
        match encode_jpeg(image, 70) {
            Ok(jpeg) => self.prime.store(Arc::new(jpeg)),
            Err(e) => tracing::debug!("Could not encode prime preview: {}", e),
        }
        self.status.write().phase = Phase::Prime;
    }

    fn level_started(&self, level: usize, groups: usize, blocks: usize) {
        let mut status = self.status.write();
        status.phase = Phase::Capturing;
        status.level = Some(level);
        status.groups = groups;
        status.groups_done = 0;
        status.blocks = blocks;
    }

    fn frame_captured(&self, _level: usize, group: usize, frame: &GrayFrame) {
        match encode_jpeg(&gray_preview(frame), 70) {
            Ok(jpeg) => self.frame.store(Arc::new(jpeg)),
            Err(e) => tracing::debug!("Could not encode frame preview: {}", e),
        }
        let mut status = self.status.write();
        status.groups_done = group + 1;
        status.frames_captured += 1;
    }

    fn level_finished(&self, _level: usize, outcome: &LevelOutcome, transport: &TransportMatrix) {
        let mut status = self.status.write();
        status.blocks += outcome.created.len();
        status.subdivided += outcome.subdivided.len();
        status.dormant_pixels = outcome.dormant;
        status.transport_entries = transport.nnz();
    }

    fn finished(&self, archive: &TransportArchive) {
        let mut status = self.status.write();
        status.phase = Phase::Finished;
        status.blocks = archive.blocks.len();
        status.transport_entries = archive.transport.nnz();
    }

    fn failed(&self, error: &AcquisitionError) {
        let mut status = self.status.write();
        status.phase = Phase::Failed;
        status.error = Some(error.to_string());
    }
}

/// Scale a [0, 1] gray frame to 8 bits for display
fn gray_preview(frame: &GrayFrame) -> GrayImage {
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let v = frame.get_pixel(x, y).0[0];
        Luma([(v * 255.0).round().clamp(0.0, 255.0) as u8])
    })
}

/// Encode an image to JPEG
fn encode_jpeg<P, C>(img: &image::ImageBuffer<P, C>, quality: u8) -> Result<Vec<u8>>
where
    P: image::PixelWithColorType<Subpixel = u8>,
    C: std::ops::Deref<Target = [u8]>,
{
    use image::ImageOutputFormat;
    use std::io::Cursor;

    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    img.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;

    Ok(jpeg_data)
}

pub fn router(state: Arc<MonitorState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Static files and UI
        .route("/", get(index_handler))
        .route("/static/*path", get(static_handler))
        // API endpoints
        .route("/api/status", get(get_status))
        .route("/api/frame", get(get_frame))
        .route("/api/frame/stream", get(frame_stream))
        .route("/api/info", get(get_info))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<MonitorState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Monitor listening on http://{}", addr);

    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Serve the main index page
async fn index_handler() -> impl IntoResponse {
    match StaticAssets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "Index not found").into_response(),
    }
}

/// Serve static files
async fn static_handler(Path(path): Path<String>) -> impl IntoResponse {
    let path = path.trim_start_matches('/');

    match StaticAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(axum::http::header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

async fn get_status(State(state): State<Arc<MonitorState>>) -> Json<AcquisitionStatus> {
    Json(state.status())
}

/// Get the latest captured frame (JPEG)
async fn get_frame(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    let frame = state.latest_frame();
    if frame.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
        frame.as_ref().clone(),
    )
        .into_response()
}

/// MJPEG stream of captured frames
async fn frame_stream(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_millis(200),
    ))
    .map(move |_| Ok::<_, std::convert::Infallible>(multipart_chunk(&state.latest_frame())));

    let body = Body::from_stream(stream);

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        body,
    )
}

fn multipart_chunk(frame: &[u8]) -> Vec<u8> {
    if frame.is_empty() {
        return b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
    }

    let mut response = Vec::with_capacity(frame.len() + 64);
    response.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    response.extend_from_slice(frame.len().to_string().as_bytes());
    response.extend_from_slice(b"\r\n\r\n");
    response.extend_from_slice(frame);
    response.extend_from_slice(b"\r\n");
    response
}

/// System information response
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    camera_width: u32,
    camera_height: u32,
    projector_width: u32,
    projector_height: u32,
    max_depth: usize,
}

async fn get_info(State(state): State<Arc<MonitorState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        camera_width: state.camera.0,
        camera_height: state.camera.1,
        projector_width: state.projector.0,
        projector_height: state.projector.1,
        max_depth: state.max_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{Acquisition, AcquisitionParams};
    use crate::simulate::SyntheticRig;

    #[test]
    fn test_status_follows_acquisition() {
        let state = Arc::new(MonitorState::new((8, 8), (8, 8), 14));
        assert_eq!(state.status().phase, Phase::Idle);
        assert!(state.latest_frame().is_empty());

        let (projector, camera) = SyntheticRig::new(8, 8, 8, 8).split();
        let mut acquisition = Acquisition::new(projector, camera, AcquisitionParams::default())
            .with_observer(state.clone());
        let archive = acquisition.run().unwrap().archive;

        let status = state.status();
        assert_eq!(status.phase, Phase::Finished);
        assert_eq!(status.blocks, archive.blocks.len());
        assert_eq!(status.transport_entries, 64);
        assert!(status.frames_captured > 0);
        assert!(status.error.is_none());

        let frame = state.latest_frame();
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_gray_preview_scales_to_bytes() {
        let frame = GrayFrame::from_raw(2, 1, vec![0.0, 1.0]).unwrap();
        let preview = gray_preview(&frame);
        assert_eq!(preview.as_raw(), &vec![0, 255]);
    }

    #[test]
    fn test_multipart_chunk() {
        let chunk = multipart_chunk(&[1, 2, 3]);
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Length: 3\r\n\r\n"));
        assert!(chunk.ends_with(&[1, 2, 3, b'\r', b'\n']));
    }

    #[tokio::test]
    async fn test_status_handler() {
        let state = Arc::new(MonitorState::new((4, 3), (8, 6), 5));
        state.level_started(2, 3, 17);
        let Json(status) = get_status(State(state.clone())).await;
        assert_eq!(status.level, Some(2));
        assert_eq!(status.groups, 3);
        assert_eq!(status.blocks, 17);

        let Json(info) = get_info(State(state)).await;
        assert_eq!(info.projector_width, 8);
        assert_eq!(info.max_depth, 5);
    }
}
