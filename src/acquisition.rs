//! Adaptive acquisition loop
//!
//! Drives the level-by-level capture: schedule conflict-free groups from the
//! current influence map, light each group and grab one frame, then hand the
//! frames to the accumulator which refines the quadtree. The camera and the
//! projector are exclusive physical resources, so everything here is strictly
//! sequential.

use image::{ImageBuffer, Luma, RgbImage};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use crate::archive::TransportArchive;
use crate::block::{Block, LevelMap, QuadtreeStore};
use crate::influence::InfluenceMap;
use crate::schedule::{schedule_groups, ColoringMethod, ConflictFreeGroup};
use crate::transport::{Accumulator, AccumulatorParams, LevelOutcome, TransportError, TransportMatrix};

/// Grayscale camera frame, intensities in [0, 1], row-major
pub type GrayFrame = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Light source under test: lights exactly the given rectangles
pub trait Projector {
    /// Projector resolution as (width, height)
    fn resolution(&self) -> (u32, u32);

    /// Light the union of the blocks at full intensity, everything else dark
    fn show(&mut self, blocks: &[&Block]) -> anyhow::Result<()>;

    /// All pixels dark
    fn clear(&mut self) -> anyhow::Result<()>;

    /// All pixels lit
    fn floodlight(&mut self) -> anyhow::Result<()>;
}

/// Observer of the scene: blocking reads synchronized by the caller
pub trait Camera {
    /// Working frame size as (width, height)
    fn frame_size(&self) -> (u32, u32);

    /// Record the dark frame subtracted from later gray reads.
    /// Called once while the projector is cleared.
    fn capture_dark_frame(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One dark-frame-subtracted grayscale frame
    fn read_gray(&mut self) -> anyhow::Result<GrayFrame>;

    /// One color frame at working resolution
    fn read_color(&mut self) -> anyhow::Result<RgbImage>;
}

/// Progress hooks, all optional
pub trait AcquisitionObserver: Send + Sync {
    fn prime_captured(&self, _image: &RgbImage) {}

    fn level_started(&self, _level: usize, _groups: usize, _blocks: usize) {}

    fn frame_captured(&self, _level: usize, _group: usize, _frame: &GrayFrame) {}

    fn level_finished(&self, _level: usize, _outcome: &LevelOutcome, _transport: &TransportMatrix) {}

    fn finished(&self, _archive: &TransportArchive) {}

    fn failed(&self, _error: &AcquisitionError) {}
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("projector failed: {0:#}")]
    Projector(anyhow::Error),
    #[error("camera capture failed at level {level}, group {group}: {cause:#}")]
    Capture {
        level: usize,
        group: usize,
        cause: anyhow::Error,
    },
    #[error("camera setup failed: {0:#}")]
    CameraSetup(anyhow::Error),
    #[error("camera frame is {got_width}x{got_height}, expected {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error("level {level}: {source}")]
    Accumulate {
        level: usize,
        #[source]
        source: TransportError,
    },
}

/// Parameters of the adaptive loop
#[derive(Debug, Clone, Copy)]
pub struct AcquisitionParams {
    /// Maximum number of capture rounds
    pub max_depth: usize,
    pub accumulator: AccumulatorParams,
    pub coloring: ColoringMethod,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            max_depth: 14,
            accumulator: AccumulatorParams::default(),
            coloring: ColoringMethod::default(),
        }
    }
}

/// Everything an acquisition produces
pub struct AcquisitionResult {
    pub archive: TransportArchive,
    /// Scene under full floodlight
    pub prime: RgbImage,
}

pub struct Acquisition<P: Projector, C: Camera> {
    projector: P,
    camera: C,
    params: AcquisitionParams,
    observer: Option<Arc<dyn AcquisitionObserver>>,
}

impl<P: Projector, C: Camera> Acquisition<P, C> {
    pub fn new(projector: P, camera: C, params: AcquisitionParams) -> Self {
        Self {
            projector,
            camera,
            params,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn AcquisitionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Give the collaborators back (e.g. to release devices)
    pub fn into_parts(self) -> (P, C) {
        (self.projector, self.camera)
    }

    /// Run the whole acquisition: dark frame, prime image, then adaptive levels
    pub fn run(&mut self) -> Result<AcquisitionResult, AcquisitionError> {
        let result = self.run_inner();
        if let (Err(e), Some(observer)) = (&result, &self.observer) {
            observer.failed(e);
        }
        result
    }

    fn run_inner(&mut self) -> Result<AcquisitionResult, AcquisitionError> {
        let started = Instant::now();
        let (projector_width, projector_height) = self.projector.resolution();
        let (camera_width, camera_height) = self.camera.frame_size();
        info!(
            "Acquisition: projector {}x{}, camera {}x{}, max depth {}",
            projector_width, projector_height, camera_width, camera_height, self.params.max_depth
        );

        self.projector.clear().map_err(AcquisitionError::Projector)?;
        self.camera
            .capture_dark_frame()
            .map_err(AcquisitionError::CameraSetup)?;

        self.projector
            .floodlight()
            .map_err(AcquisitionError::Projector)?;
        let prime = self.camera.read_color().map_err(AcquisitionError::CameraSetup)?;
        if prime.dimensions() != (camera_width, camera_height) {
            return Err(AcquisitionError::FrameSize {
                width: camera_width,
                height: camera_height,
                got_width: prime.width(),
                got_height: prime.height(),
            });
        }
        if let Some(observer) = &self.observer {
            observer.prime_captured(&prime);
        }

        let strategy = self.params.coloring.strategy();
        let accumulator = Accumulator::new(self.params.accumulator);

        let mut store = QuadtreeStore::with_root(projector_height, projector_width);
        let mut levels = LevelMap::new();
        let mut transport = TransportMatrix::new();
        let mut map = InfluenceMap::uniform(camera_width, camera_height, [0]);

        for level in 0..self.params.max_depth {
            let level_started = Instant::now();
            let groups = schedule_groups(&map, strategy.as_ref());
            let active: usize = groups.iter().map(|g| g.len()).sum();
            info!(
                "Capturing level {}: {} active blocks in {} groups",
                level,
                active,
                groups.len()
            );
            if let Some(observer) = &self.observer {
                observer.level_started(level, groups.len(), store.len());
            }

            let frames = self.acquire_images(level, &groups, &store)?;

            let last_round = level + 1 == self.params.max_depth;
            let outcome = accumulator
                .process(&map, &groups, &frames, &mut store, &mut transport, !last_round)
                .map_err(|source| AcquisitionError::Accumulate { level, source })?;

            info!(
                "Level {} done in {:.1}s: {} subdivided, {} new blocks, {} entries recorded ({} total), {} dormant pixels",
                level,
                level_started.elapsed().as_secs_f64(),
                outcome.subdivided.len(),
                outcome.created.len(),
                outcome.recorded,
                transport.nnz(),
                outcome.dormant
            );
            if let Some(observer) = &self.observer {
                observer.level_finished(level, &outcome, &transport);
            }

            levels.insert(level + 1, outcome.created.clone());
            let subdivided = outcome.subdivided_any();
            map = outcome.next;

            if !subdivided {
                break;
            }
        }

        self.projector.clear().map_err(AcquisitionError::Projector)?;

        let archive = TransportArchive {
            camera_width,
            camera_height,
            transport,
            blocks: store,
            levels,
        };
        info!(
            "Acquisition finished in {:.1}s: {} blocks, {} levels, {} transport entries",
            started.elapsed().as_secs_f64(),
            archive.blocks.len(),
            archive.levels.len(),
            archive.transport.nnz()
        );
        if let Some(observer) = &self.observer {
            observer.finished(&archive);
        }

        Ok(AcquisitionResult { archive, prime })
    }

    /// Light each group in turn and capture one gray frame per group
    pub fn acquire_images(
        &mut self,
        level: usize,
        groups: &[ConflictFreeGroup],
        store: &QuadtreeStore,
    ) -> Result<Vec<GrayFrame>, AcquisitionError> {
        let (width, height) = self.camera.frame_size();
        let mut frames = Vec::with_capacity(groups.len());

        for (index, group) in groups.iter().enumerate() {
            let blocks: Vec<&Block> = group.iter().filter_map(|&id| store.get(id)).collect();
            self.projector
                .show(&blocks)
                .map_err(AcquisitionError::Projector)?;

            let frame = self
                .camera
                .read_gray()
                .map_err(|cause| AcquisitionError::Capture {
                    level,
                    group: index,
                    cause,
                })?;
            if frame.dimensions() != (width, height) {
                return Err(AcquisitionError::FrameSize {
                    width,
                    height,
                    got_width: frame.width(),
                    got_height: frame.height(),
                });
            }

            debug!(
                "Level {} group {}/{}: {} blocks lit",
                level,
                index + 1,
                groups.len(),
                blocks.len()
            );
            if let Some(observer) = &self.observer {
                observer.frame_captured(level, index, &frame);
            }
            frames.push(frame);
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::verify_groups;
    use crate::simulate::SyntheticRig;
    use parking_lot::Mutex;

    fn params(max_depth: usize) -> AcquisitionParams {
        AcquisitionParams {
            max_depth,
            ..Default::default()
        }
    }

    #[test]
    fn test_one_to_one_rig_resolves_every_pixel() {
        let rig = SyntheticRig::new(16, 16, 16, 16);
        let (projector, camera) = rig.split();
        let mut acquisition = Acquisition::new(projector, camera, params(14));
        let result = acquisition.run().unwrap();
        let archive = result.archive;

        // 16 -> 8 -> 4 -> 2 -> 1, then one more round to record the single pixels
        assert_eq!(archive.levels.len(), 6);
        assert_eq!(archive.levels.get(4).unwrap().len(), 256);
        assert!(archive.levels.get(5).unwrap().is_empty());
        assert_eq!(archive.transport.nnz(), 256);

        for (block, row) in archive.transport.rows() {
            let b = archive.blocks.get(block).unwrap();
            assert!(b.is_leaf());
            assert_eq!((b.height(), b.width()), (1, 1));
            let (&pixel, _) = row.iter().next().unwrap();
            assert_eq!(pixel, b.min_x as usize * 16 + b.min_y as usize);
        }
        archive.validate().unwrap();
        assert_eq!(result.prime.dimensions(), (16, 16));
    }

    #[test]
    fn test_max_depth_stops_refinement() {
        let rig = SyntheticRig::new(16, 16, 16, 16);
        let (projector, camera) = rig.split();
        let mut acquisition = Acquisition::new(projector, camera, params(2));
        let archive = acquisition.run().unwrap().archive;

        assert_eq!(archive.levels.len(), 3);
        assert!(archive.levels.get(2).unwrap().is_empty());
        // Every pixel ends up recorded against one of the four level-1 blocks
        assert_eq!(archive.transport.nnz(), 256);
        assert!(archive.transport.blocks().all(|b| (1..5).contains(&b)));
        archive.validate().unwrap();
    }

    #[test]
    fn test_dark_scene_records_nothing() {
        let rig = SyntheticRig::new(8, 8, 8, 8).with_albedo(|_, _| 0.0);
        let (projector, camera) = rig.split();
        let mut acquisition = Acquisition::new(projector, camera, params(14));
        let archive = acquisition.run().unwrap().archive;

        assert_eq!(archive.blocks.len(), 1);
        assert!(archive.transport.is_empty());
        assert_eq!(archive.levels.len(), 2);
    }

    #[derive(Default)]
    struct ScheduleChecker {
        violations: Mutex<usize>,
        levels: Mutex<Vec<usize>>,
    }

    impl AcquisitionObserver for ScheduleChecker {
        fn level_started(&self, level: usize, _groups: usize, _blocks: usize) {
            self.levels.lock().push(level);
        }

        fn level_finished(&self, _level: usize, outcome: &LevelOutcome, _transport: &TransportMatrix) {
            let groups = schedule_groups(&outcome.next, &crate::schedule::LargestFirst);
            *self.violations.lock() += verify_groups(&outcome.next, &groups).len();
        }
    }

    #[test]
    fn test_downscaled_camera_schedules_stay_conflict_free() {
        let rig = SyntheticRig::new(32, 24, 12, 9);
        let (projector, camera) = rig.split();
        let checker = Arc::new(ScheduleChecker::default());
        let mut acquisition =
            Acquisition::new(projector, camera, params(14)).with_observer(checker.clone());
        let archive = acquisition.run().unwrap().archive;

        assert_eq!(*checker.violations.lock(), 0);
        assert!(checker.levels.lock().len() <= 14);
        assert!(!archive.transport.is_empty());
        archive.validate().unwrap();
    }

    struct FailingCamera;

    impl Camera for FailingCamera {
        fn frame_size(&self) -> (u32, u32) {
            (4, 4)
        }

        fn read_gray(&mut self) -> anyhow::Result<GrayFrame> {
            anyhow::bail!("device unplugged")
        }

        fn read_color(&mut self) -> anyhow::Result<RgbImage> {
            Ok(RgbImage::new(4, 4))
        }
    }

    #[test]
    fn test_capture_failure_is_fatal() {
        let (projector, _) = SyntheticRig::new(4, 4, 4, 4).split();
        let mut acquisition = Acquisition::new(projector, FailingCamera, params(14));
        let err = acquisition.run().err().unwrap();
        assert!(matches!(err, AcquisitionError::Capture { level: 0, group: 0, .. }));
    }
}
