// src/pipeline.rs
//
// Per-frame orchestration. Lane geometry and vehicle detection have no
// data dependency and run as two blocking tasks joined before any
// per-object work; association, motion and scoring then run strictly
// in order per object, since each step feeds the next and all three
// mutate tracker state in place. A per-frame deadline turns a slow
// frame into a skipped contribution instead of an unbounded stall.

use crate::association::ObjectTracker;
use crate::lane_geometry::{LaneGeometry, LaneGeometryEstimator};
use crate::motion::MotionEstimator;
use crate::risk::RiskScorer;
use crate::types::{Config, Frame, RiskAssessment};
use crate::vehicle_detection::{Detection, VehicleDetector};
use crate::video_source::frame_to_mat;
use anyhow::Result;
use opencv::{core::Mat, imgproc, prelude::*};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// One scored object for the renderer and event log.
#[derive(Debug, Clone)]
pub struct ObjectAssessment {
    pub track_id: u32,
    pub bbox: [f32; 4],
    pub class_name: &'static str,
    pub motion_kmh: f32,
    pub risk: RiskAssessment,
}

#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub geometry: LaneGeometry,
    pub objects: Vec<ObjectAssessment>,
}

/// The frame at working resolution plus its analysis. `analysis` is
/// None when the frame missed its processing deadline.
pub struct ProcessedFrame {
    pub frame: Frame,
    pub analysis: Option<FrameAnalysis>,
}

pub struct FrameOrchestrator {
    config: Config,
    lane_estimator: Arc<Mutex<LaneGeometryEstimator>>,
    detector: Arc<Mutex<VehicleDetector>>,
    tracker: ObjectTracker,
    motion: MotionEstimator,
    scorer: RiskScorer,
}

impl FrameOrchestrator {
    pub fn new(config: &Config, fps: f64) -> Result<Self> {
        let detector =
            VehicleDetector::new(&config.model.path, config.model.nms_iou_threshold)?;
        Ok(Self {
            config: config.clone(),
            lane_estimator: Arc::new(Mutex::new(LaneGeometryEstimator::new(
                config.lane.clone(),
            ))),
            detector: Arc::new(Mutex::new(detector)),
            tracker: ObjectTracker::new(config.tracking.clone()),
            motion: MotionEstimator::new(config.motion.clone(), fps),
            scorer: RiskScorer::new(config.risk.clone()),
        })
    }

    pub async fn process(&mut self, frame: Frame, frame_id: u64) -> Result<ProcessedFrame> {
        let frame = resize_to_working(
            frame,
            self.config.video.working_width,
            self.config.video.working_height,
        )?;

        let lane_estimator = Arc::clone(&self.lane_estimator);
        let lane_frame = frame.clone();
        let lane_task = tokio::task::spawn_blocking(move || -> Result<LaneGeometry> {
            let mat = frame_to_mat(&lane_frame)?;
            lane_estimator.lock().unwrap().detect_lane(&mat)
        });

        let detector = Arc::clone(&self.detector);
        let detect_frame = frame.clone();
        let confidence_floor = self.config.model.confidence_floor;
        let detect_task = tokio::task::spawn_blocking(move || -> Result<Vec<Detection>> {
            let mat = frame_to_mat(&detect_frame)?;
            detector.lock().unwrap().detect(&mat, confidence_floor)
        });

        let deadline = Duration::from_millis(self.config.orchestrator.frame_deadline_ms);
        let joined =
            tokio::time::timeout(deadline, async { tokio::try_join!(lane_task, detect_task) })
                .await;

        let (geometry, detections) = match joined {
            Ok(Ok((lane_result, detect_result))) => (lane_result?, detect_result?),
            Ok(Err(join_error)) => return Err(join_error.into()),
            Err(_) => {
                // The blocking tasks finish on their own and release
                // the component locks; this frame just contributes
                // nothing.
                warn!(
                    "frame {} missed the {}ms deadline, skipping",
                    frame_id, self.config.orchestrator.frame_deadline_ms
                );
                return Ok(ProcessedFrame {
                    frame,
                    analysis: None,
                });
            }
        };

        let gray = {
            let mat = frame_to_mat(&frame)?;
            let mut gray = Mat::default();
            imgproc::cvt_color(&mat, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
            gray
        };

        let centroids: Vec<(f32, f32)> = detections.iter().map(|d| d.centroid()).collect();
        let ids = self.tracker.associate(&centroids, frame_id);

        let mut objects = Vec::with_capacity(detections.len());
        for (detection, id) in detections.iter().zip(&ids) {
            let Some(track) = self.tracker.get_mut(*id) else {
                continue;
            };
            let motion_kmh = self.motion.estimate_motion(&gray, &detection.bbox, track)?;
            let risk = self.scorer.score(track, &geometry, frame_id);
            objects.push(ObjectAssessment {
                track_id: *id,
                bbox: detection.bbox,
                class_name: detection.class_name,
                motion_kmh,
                risk,
            });
        }

        Ok(ProcessedFrame {
            frame,
            analysis: Some(FrameAnalysis { geometry, objects }),
        })
    }

    pub fn unique_identities(&self) -> u32 {
        self.tracker.unique_count()
    }
}

fn resize_to_working(frame: Frame, width: i32, height: i32) -> Result<Frame> {
    if frame.width == width as usize && frame.height == height as usize {
        return Ok(frame);
    }
    let mat = frame_to_mat(&frame)?;
    let mut resized = Mat::default();
    imgproc::resize(
        &mat,
        &mut resized,
        opencv::core::Size::new(width, height),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    Ok(Frame {
        data: resized.data_bytes()?.to_vec(),
        width: width as usize,
        height: height as usize,
        timestamp_ms: frame.timestamp_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_to_working_resolution() {
        let frame = Frame {
            data: vec![0u8; 1280 * 720 * 3],
            width: 1280,
            height: 720,
            timestamp_ms: 33.3,
        };
        let resized = resize_to_working(frame, 640, 480).unwrap();
        assert_eq!((resized.width, resized.height), (640, 480));
        assert_eq!(resized.data.len(), 640 * 480 * 3);
        assert_eq!(resized.timestamp_ms, 33.3);
    }

    #[test]
    fn test_resize_passthrough_at_working_resolution() {
        let frame = Frame {
            data: vec![9u8; 640 * 480 * 3],
            width: 640,
            height: 480,
            timestamp_ms: 0.0,
        };
        let out = resize_to_working(frame.clone(), 640, 480).unwrap();
        assert_eq!(out.data, frame.data);
    }
}
