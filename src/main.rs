//! DualCapture - Adaptive light transport capture for projector-camera rigs
//!
//! This application lights a scene with a projector, block by block, and
//! records how much of each projector region reaches each camera pixel. The
//! blocks are refined as a quadtree wherever the camera sees enough energy,
//! and blocks that no camera pixel sees together are lit at the same time.
//! The resulting light transport matrix is then used to render the scene as
//! seen from the projector (the dual image).

mod acquisition;
mod archive;
mod block;
mod camera_controls;
mod capture;
mod config;
mod influence;
mod output;
mod reconstruct;
mod schedule;
mod server;
mod simulate;
mod transport;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::acquisition::{Acquisition, AcquisitionResult, Camera, Projector};
use crate::archive::TransportArchive;
use crate::config::Config;
use crate::server::MonitorState;

/// DualCapture - projector-camera light transport acquisition
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture the light transport with the configured camera and projector
    Capture {
        /// Directory for the transport archive and prime image
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Serve the acquisition monitor even if disabled in the config
        #[arg(short, long)]
        monitor: bool,
    },

    /// Run the acquisition against a synthetic rig and render the result
    Simulate {
        #[arg(long, default_value_t = 128)]
        projector_width: u32,

        #[arg(long, default_value_t = 96)]
        projector_height: u32,

        #[arg(long, default_value_t = 64)]
        camera_width: u32,

        #[arg(long, default_value_t = 48)]
        camera_height: u32,

        /// Directory for the transport archive, prime image and dual image
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Serve the acquisition monitor even if disabled in the config
        #[arg(short, long)]
        monitor: bool,
    },

    /// Render the dual image from a stored acquisition
    Render {
        /// Directory holding the transport archive and prime image
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Rendered image path (overrides the config)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Deepest quadtree level to blend (overrides the config)
        #[arg(long)]
        max_level: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("DualCapture v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let config = Config::load_or_create(&args.config)?;

    match args.command {
        Command::Capture { output_dir, monitor } => {
            let output_dir = output_dir.unwrap_or_else(|| config.acquisition.output_dir.clone());
            let camera_config = config.camera.clone();
            let projector_config = config.projector.clone();

            info!("Camera: {} ({}x{} working resolution)", camera_config.device, camera_config.width, camera_config.height);
            info!("Projector: {} ({}x{})", projector_config.device, projector_config.width, projector_config.height);

            let geometry = (
                (camera_config.width, camera_config.height),
                (projector_config.width, projector_config.height),
            );
            run_acquisition(&config, &output_dir, monitor, geometry, move || {
                let projector = output::LoopbackProjector::open(&projector_config)?;
                let camera = capture::V4lCamera::open(&camera_config)?;
                Ok((projector, camera))
            })
            .await?;
        }

        Command::Simulate {
            projector_width,
            projector_height,
            camera_width,
            camera_height,
            output_dir,
            monitor,
        } => {
            let output_dir = output_dir.unwrap_or_else(|| config.acquisition.output_dir.clone());
            info!(
                "Simulating projector {}x{} with camera {}x{}",
                projector_width, projector_height, camera_width, camera_height
            );

            let geometry = ((camera_width, camera_height), (projector_width, projector_height));
            run_acquisition(&config, &output_dir, monitor, geometry, move || {
                let rig = simulate::SyntheticRig::new(projector_width, projector_height, camera_width, camera_height)
                    .with_albedo(checkerboard_albedo);
                Ok(rig.split())
            })
            .await?;

            let output = dual_image_path(&output_dir, &config.render.output);
            render(&output_dir, &output, &config.render.params())?;
        }

        Command::Render { output_dir, output, max_level } => {
            let output_dir = output_dir.unwrap_or_else(|| config.acquisition.output_dir.clone());
            let output = output.unwrap_or_else(|| dual_image_path(&output_dir, &config.render.output));
            let mut params = config.render.params();
            if let Some(max_level) = max_level {
                params.max_level = max_level;
            }
            render(&output_dir, &output, &params)?;
        }
    }

    Ok(())
}

/// Run an acquisition on a blocking thread, optionally serving the monitor,
/// and store the result in `output_dir`
async fn run_acquisition<F, P, C>(
    config: &Config,
    output_dir: &Path,
    force_monitor: bool,
    geometry: ((u32, u32), (u32, u32)),
    open: F,
) -> Result<()>
where
    F: FnOnce() -> Result<(P, C)> + Send + 'static,
    P: Projector + 'static,
    C: Camera + 'static,
{
    let params = config.acquisition.params();

    let monitor = (force_monitor || config.monitor.enabled)
        .then(|| Arc::new(MonitorState::new(geometry.0, geometry.1, params.max_depth)));

    // Start the web server
    if let Some(state) = &monitor {
        let addr = format!("{}:{}", config.monitor.host, config.monitor.port);
        info!("Starting acquisition monitor at http://{}", addr);
        let server_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_server(&addr, server_state).await {
                error!("Monitor error: {:#}", e);
            }
        });
    }

    // Devices are opened on the acquisition thread and never leave it
    let observer = monitor.clone();
    let AcquisitionResult { archive, prime } = tokio::task::spawn_blocking(move || -> Result<AcquisitionResult> {
        let (projector, camera) = open()?;
        let mut acquisition = Acquisition::new(projector, camera, params);
        if let Some(observer) = observer {
            acquisition = acquisition.with_observer(observer);
        }
        Ok(acquisition.run()?)
    })
    .await
    .context("Acquisition task panicked")??;

    archive.save(output_dir)?;
    archive::save_prime(output_dir, &prime)?;

    if monitor.is_some() {
        info!("Acquisition complete; monitor still running, press Ctrl+C to exit");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for Ctrl+C")?;
    }

    Ok(())
}

/// Load a stored acquisition and write its dual image
fn render(input_dir: &Path, output: &Path, params: &reconstruct::RenderParams) -> Result<()> {
    let started = Instant::now();
    let archive = TransportArchive::load(input_dir)?;
    let prime = archive::load_prime(input_dir)?;

    let dual = reconstruct::reconstruct(&archive, &prime, params)
        .with_context(|| format!("Failed to render dual image from {:?}", input_dir))?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    dual.to_rgb8()
        .save(output)
        .with_context(|| format!("Failed to write dual image {:?}", output))?;

    info!(
        "Rendered {}x{} dual image to {:?} in {:.2}s",
        dual.width,
        dual.height,
        output,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Where the configured dual image goes: relative paths live in the capture directory
fn dual_image_path(output_dir: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        output_dir.join(configured)
    }
}

/// Reflectance pattern for the synthetic scene, so the dual image has structure
fn checkerboard_albedo(row: u32, col: u32) -> f32 {
    if (row / 8 + col / 8) % 2 == 0 {
        0.9
    } else {
        0.3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dual_image_path() {
        let dir = Path::new("capture");
        assert_eq!(
            dual_image_path(dir, Path::new("dual_image.png")),
            PathBuf::from("capture/dual_image.png")
        );
        assert_eq!(
            dual_image_path(dir, Path::new("renders/dual.png")),
            PathBuf::from("capture/renders/dual.png")
        );
        assert_eq!(
            dual_image_path(dir, Path::new("/tmp/dual.png")),
            PathBuf::from("/tmp/dual.png")
        );
    }
}
