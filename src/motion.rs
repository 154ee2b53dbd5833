// src/motion.rs
//
// Per-object motion from dense Farneback optical flow computed over
// the detection crop only, so cost scales with object size rather than
// frame size. The mean flow magnitude is converted to km/h with a
// fixed pixel-to-meter scale and smoothed per identity.

use crate::association::TrackedObject;
use crate::types::MotionConfig;
use anyhow::Result;
use opencv::{
    core::{self, Mat, Rect},
    prelude::*,
    video,
};

pub struct MotionEstimator {
    cfg: MotionConfig,
    fps: f64,
    prev_gray: Option<Mat>,
}

impl MotionEstimator {
    pub fn new(cfg: MotionConfig, fps: f64) -> Self {
        Self {
            cfg,
            fps,
            prev_gray: None,
        }
    }

    /// Update the track's smoothed motion from the flow inside `bbox`
    /// and return it. The very first call only caches the grayscale
    /// frame and reports 0. Crops under 2 px in either dimension skip
    /// the flow computation; the prior smoothed value stands. The
    /// current frame is cached as "previous" at the end of every call.
    pub fn estimate_motion(
        &mut self,
        gray: &Mat,
        bbox: &[f32; 4],
        track: &mut TrackedObject,
    ) -> Result<f32> {
        let prev = match self.prev_gray.take() {
            Some(prev) => prev,
            None => {
                self.prev_gray = Some(gray.clone());
                return Ok(0.0);
            }
        };

        let size = gray.size()?;
        if let Some(rect) = clamp_bbox(bbox, size.width, size.height) {
            let prev_crop = Mat::roi(&prev, rect)?.try_clone()?;
            let curr_crop = Mat::roi(gray, rect)?.try_clone()?;

            let mut flow = Mat::default();
            video::calc_optical_flow_farneback(
                &prev_crop, &curr_crop, &mut flow, 0.5, 3, 15, 3, 5, 1.2, 0,
            )?;

            let mut channels: core::Vector<Mat> = core::Vector::new();
            core::split(&flow, &mut channels)?;
            let mut mag = Mat::default();
            core::magnitude(&channels.get(0)?, &channels.get(1)?, &mut mag)?;
            let avg_motion = core::mean(&mag, &core::no_array())?[0] as f32;

            let raw_kmh = flow_to_kmh(avg_motion, self.cfg.scale_factor, self.fps);
            track.smoothed_motion = Some(smooth(
                track.smoothed_motion,
                raw_kmh,
                self.cfg.smoothing_alpha,
            ));
        }

        self.prev_gray = Some(gray.clone());
        Ok(track.smoothed_motion.unwrap_or(0.0))
    }
}

/// Mean pixel motion per frame -> km/h via the calibration scale and
/// the frame interval 1/fps.
fn flow_to_kmh(avg_motion: f32, scale_factor: f32, fps: f64) -> f32 {
    let dt = 1.0 / fps as f32;
    let meters_per_sec = (avg_motion * scale_factor) / dt;
    meters_per_sec * 3.6
}

/// Exponential smoothing seeded with the first raw sample.
fn smooth(prev: Option<f32>, raw: f32, alpha: f32) -> f32 {
    match prev {
        None => raw,
        Some(s) => alpha * raw + (1.0 - alpha) * s,
    }
}

/// Clamp the bbox to frame bounds; None when the resulting crop is too
/// small for flow (fewer than 2 px in either dimension).
fn clamp_bbox(bbox: &[f32; 4], width: i32, height: i32) -> Option<Rect> {
    let x1 = (bbox[0].max(0.0) as i32).min(width - 1);
    let y1 = (bbox[1].max(0.0) as i32).min(height - 1);
    let x2 = (bbox[2] as i32).clamp(x1, width);
    let y2 = (bbox[3] as i32).clamp(y1, height);

    let rect = Rect::new(x1, y1, x2 - x1, y2 - y1);
    if rect.width > 1 && rect.height > 1 {
        Some(rect)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MatchingMode, TrackingConfig};

    fn motion_config() -> MotionConfig {
        MotionConfig {
            scale_factor: 0.05,
            smoothing_alpha: 0.4,
        }
    }

    fn track_at(x: f32, y: f32) -> TrackedObject {
        let mut tracker = crate::association::ObjectTracker::new(TrackingConfig {
            gate_px: 50.0,
            matching: MatchingMode::Legacy,
        });
        let ids = tracker.associate(&[(x, y)], 1);
        tracker.get(ids[0]).unwrap().clone()
    }

    fn gray_frame(value: f64) -> Mat {
        Mat::new_rows_cols_with_default(120, 160, core::CV_8UC1, core::Scalar::all(value)).unwrap()
    }

    #[test]
    fn test_smoothing_seeds_with_first_raw_value() {
        assert_eq!(smooth(None, 37.5, 0.4), 37.5);
    }

    #[test]
    fn test_smoothing_blends_after_seed() {
        let seeded = smooth(None, 10.0, 0.4);
        let next = smooth(Some(seeded), 20.0, 0.4);
        assert!((next - (0.4 * 20.0 + 0.6 * 10.0)).abs() < 1e-5);
    }

    #[test]
    fn test_flow_to_kmh_units() {
        // 10 px/frame at 0.05 m/px and 30 fps = 15 m/s = 54 km/h
        assert!((flow_to_kmh(10.0, 0.05, 30.0) - 54.0).abs() < 1e-3);
    }

    #[test]
    fn test_first_call_caches_and_returns_zero() {
        let mut estimator = MotionEstimator::new(motion_config(), 30.0);
        let mut track = track_at(50.0, 50.0);
        let gray = gray_frame(0.0);
        let v = estimator
            .estimate_motion(&gray, &[10.0, 10.0, 60.0, 60.0], &mut track)
            .unwrap();
        assert_eq!(v, 0.0);
        assert!(track.smoothed_motion.is_none());
        assert!(estimator.prev_gray.is_some());
    }

    #[test]
    fn test_degenerate_crop_retains_prior_value() {
        let mut estimator = MotionEstimator::new(motion_config(), 30.0);
        let mut track = track_at(50.0, 50.0);
        track.smoothed_motion = Some(12.0);

        let gray = gray_frame(0.0);
        estimator
            .estimate_motion(&gray, &[10.0, 10.0, 60.0, 60.0], &mut track)
            .unwrap();
        // 1x1 box: flow is skipped, smoothed value untouched
        let v = estimator
            .estimate_motion(&gray, &[10.0, 10.0, 11.0, 11.0], &mut track)
            .unwrap();
        assert_eq!(v, 12.0);
        assert_eq!(track.smoothed_motion, Some(12.0));
    }

    #[test]
    fn test_static_crop_produces_near_zero_motion() {
        let mut estimator = MotionEstimator::new(motion_config(), 30.0);
        let mut track = track_at(50.0, 50.0);
        let gray = gray_frame(128.0);

        estimator
            .estimate_motion(&gray, &[10.0, 10.0, 60.0, 60.0], &mut track)
            .unwrap();
        let v = estimator
            .estimate_motion(&gray, &[10.0, 10.0, 60.0, 60.0], &mut track)
            .unwrap();
        assert!(v.abs() < 1.0);
    }

    #[test]
    fn test_clamp_bbox_bounds() {
        assert!(clamp_bbox(&[-20.0, -20.0, 50.0, 50.0], 160, 120).is_some());
        let rect = clamp_bbox(&[100.0, 100.0, 400.0, 400.0], 160, 120).unwrap();
        assert!(rect.x + rect.width <= 160);
        assert!(rect.y + rect.height <= 120);
        assert!(clamp_bbox(&[10.0, 10.0, 10.5, 80.0], 160, 120).is_none());
    }
}
