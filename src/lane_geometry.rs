// src/lane_geometry.rs
//
// Per-frame lane boundary estimation: HSV paint masking, Canny edges,
// a trapezoidal ROI anchored at the image bottom, probabilistic Hough
// segments, then one least-squares line per side smoothed over a short
// history to keep frame-to-frame jitter out of the overlay.

use crate::types::{LaneConfig, LaneFallback};
use anyhow::Result;
use opencv::{
    core::{self, Mat, Point, Scalar, Vector},
    imgproc,
    prelude::*,
};
use std::collections::VecDeque;

/// A fitted lane boundary, described by its endpoints at the ROI's
/// bottom (full frame height) and top (roi_top_ratio * height).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaneLine {
    pub x_bottom: f32,
    pub y_bottom: f32,
    pub x_top: f32,
    pub y_top: f32,
}

/// Per-frame geometry output. lane_center and lane_width fall back to
/// half the frame width whenever either boundary is absent.
#[derive(Debug, Clone, Copy)]
pub struct LaneGeometry {
    pub lane_center: f32,
    pub lane_width: f32,
    pub left: Option<LaneLine>,
    pub right: Option<LaneLine>,
}

impl LaneGeometry {
    pub fn default_for(width: f32) -> Self {
        Self {
            lane_center: width / 2.0,
            lane_width: width / 2.0,
            left: None,
            right: None,
        }
    }
}

/// Bounded recent history of fitted lines for one side. The smoothed
/// line is the coordinate-wise mean over the window.
#[derive(Debug, Clone)]
pub struct LaneLineHistory {
    lines: VecDeque<LaneLine>,
    capacity: usize,
}

impl LaneLineHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: LaneLine) {
        self.lines.push_back(line);
        if self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    pub fn average(&self) -> Option<LaneLine> {
        if self.lines.is_empty() {
            return None;
        }
        let n = self.lines.len() as f32;
        let mut acc = [0.0f32; 4];
        for line in &self.lines {
            acc[0] += line.x_bottom;
            acc[1] += line.y_bottom;
            acc[2] += line.x_top;
            acc[3] += line.y_top;
        }
        Some(LaneLine {
            x_bottom: acc[0] / n,
            y_bottom: acc[1] / n,
            x_top: acc[2] / n,
            y_top: acc[3] / n,
        })
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }
}

#[derive(Debug, Clone)]
struct SideState {
    history: LaneLineHistory,
    prev_raw: Option<LaneLine>,
}

impl SideState {
    fn new(capacity: usize) -> Self {
        Self {
            history: LaneLineHistory::new(capacity),
            prev_raw: None,
        }
    }
}

pub struct LaneGeometryEstimator {
    cfg: LaneConfig,
    left: SideState,
    right: SideState,
}

impl LaneGeometryEstimator {
    pub fn new(cfg: LaneConfig) -> Self {
        let capacity = cfg.history_len;
        Self {
            cfg,
            left: SideState::new(capacity),
            right: SideState::new(capacity),
        }
    }

    /// Full per-frame pass over a BGR frame at working resolution.
    /// Finding no lines at all is a normal state, not an error.
    pub fn detect_lane(&mut self, bgr: &Mat) -> Result<LaneGeometry> {
        let size = bgr.size()?;
        let (width, height) = (size.width, size.height);
        let segments = self.extract_segments(bgr, width, height)?;
        Ok(self.update_from_segments(&segments, width as f32, height as f32))
    }

    /// Deterministic geometry update from raw Hough segments. Split out
    /// from the OpenCV stage so the fit/smoothing logic is testable on
    /// synthetic segments.
    pub fn update_from_segments(
        &mut self,
        segments: &[[f32; 4]],
        width: f32,
        height: f32,
    ) -> LaneGeometry {
        let mut left_candidates: Vec<[f32; 4]> = Vec::new();
        let mut right_candidates: Vec<[f32; 4]> = Vec::new();

        for seg in segments {
            let [x1, y1, x2, y2] = *seg;
            let dx = x2 - x1;
            if dx == 0.0 {
                continue;
            }
            let slope = (y2 - y1) / dx;
            if slope.abs() < self.cfg.min_abs_slope || slope.abs() > self.cfg.max_abs_slope {
                continue;
            }
            if slope < 0.0 {
                left_candidates.push(*seg);
            } else {
                right_candidates.push(*seg);
            }
        }

        let y_bottom = height;
        let y_top = height * self.cfg.roi_top_ratio;
        let fallback = self.cfg.fallback;

        update_side(&mut self.left, &left_candidates, y_bottom, y_top, fallback);
        update_side(&mut self.right, &right_candidates, y_bottom, y_top, fallback);

        let left = self.left.history.average();
        let right = self.right.history.average();

        let mut geometry = LaneGeometry::default_for(width);
        geometry.left = left;
        geometry.right = right;
        if let (Some(l), Some(r)) = (left, right) {
            geometry.lane_center = (l.x_bottom + r.x_bottom) / 2.0;
            geometry.lane_width = r.x_bottom - l.x_bottom;
        }
        geometry
    }

    fn extract_segments(&self, bgr: &Mat, width: i32, height: i32) -> Result<Vec<[f32; 4]>> {
        let mut hsv = Mat::default();
        imgproc::cvt_color(bgr, &mut hsv, imgproc::COLOR_BGR2HSV, 0)?;

        // White and yellow lane paint, unioned
        let mut white_mask = Mat::default();
        core::in_range(
            &hsv,
            &Scalar::new(0.0, 0.0, 200.0, 0.0),
            &Scalar::new(180.0, 30.0, 255.0, 0.0),
            &mut white_mask,
        )?;
        let mut yellow_mask = Mat::default();
        core::in_range(
            &hsv,
            &Scalar::new(20.0, 100.0, 100.0, 0.0),
            &Scalar::new(30.0, 255.0, 255.0, 0.0),
            &mut yellow_mask,
        )?;
        let mut mask = Mat::default();
        core::bitwise_or(&white_mask, &yellow_mask, &mut mask, &core::no_array())?;

        let mut edges = Mat::default();
        imgproc::canny(&mask, &mut edges, 50.0, 150.0, 3, false)?;

        // Trapezoidal ROI anchored at the image bottom
        let w = width as f32;
        let h = height as f32;
        let mut roi_mask = Mat::zeros(height, width, core::CV_8UC1)?.to_mat()?;
        let mut vertices: Vector<Point> = Vector::new();
        vertices.push(Point::new(0, height));
        vertices.push(Point::new((w * self.cfg.roi_left_ratio) as i32, (h * self.cfg.roi_top_ratio) as i32));
        vertices.push(Point::new((w * self.cfg.roi_right_ratio) as i32, (h * self.cfg.roi_top_ratio) as i32));
        vertices.push(Point::new(width, height));
        let mut polygons: Vector<Vector<Point>> = Vector::new();
        polygons.push(vertices);
        imgproc::fill_poly(
            &mut roi_mask,
            &polygons,
            Scalar::all(255.0),
            imgproc::LINE_8,
            0,
            Point::new(0, 0),
        )?;

        let mut masked_edges = Mat::default();
        core::bitwise_and(&edges, &roi_mask, &mut masked_edges, &core::no_array())?;

        let mut lines: Vector<core::Vec4i> = Vector::new();
        imgproc::hough_lines_p(
            &masked_edges,
            &mut lines,
            1.0,
            std::f64::consts::PI / 180.0,
            20,
            30.0,
            50.0,
        )?;

        Ok(lines
            .iter()
            .map(|l| [l[0] as f32, l[1] as f32, l[2] as f32, l[3] as f32])
            .collect())
    }
}

fn update_side(
    side: &mut SideState,
    candidates: &[[f32; 4]],
    y_bottom: f32,
    y_top: f32,
    fallback: LaneFallback,
) {
    if candidates.is_empty() {
        match fallback {
            LaneFallback::LastRawFit => {
                if let Some(prev) = side.prev_raw {
                    side.history.push(prev);
                }
            }
            LaneFallback::HistoryAverage => {}
        }
        return;
    }

    if let Some(line) = fit_line_through_segments(candidates, y_bottom, y_top) {
        side.prev_raw = Some(line);
        side.history.push(line);
    }
}

/// Least-squares regression of x on y over all segment endpoints,
/// evaluated at the ROI's bottom and top.
fn fit_line_through_segments(segments: &[[f32; 4]], y_bottom: f32, y_top: f32) -> Option<LaneLine> {
    let mut points: Vec<(f64, f64)> = Vec::with_capacity(segments.len() * 2);
    for seg in segments {
        points.push((seg[1] as f64, seg[0] as f64));
        points.push((seg[3] as f64, seg[2] as f64));
    }

    let n = points.len() as f64;
    let mean_y: f64 = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_x: f64 = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut cov = 0.0f64;
    let mut var = 0.0f64;
    for (y, x) in &points {
        cov += (y - mean_y) * (x - mean_x);
        var += (y - mean_y) * (y - mean_y);
    }
    if var.abs() < f64::EPSILON {
        return None;
    }

    let a = cov / var;
    let b = mean_x - a * mean_y;

    Some(LaneLine {
        x_bottom: (a * y_bottom as f64 + b) as f32,
        y_bottom,
        x_top: (a * y_top as f64 + b) as f32,
        y_top,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane_config(fallback: LaneFallback) -> LaneConfig {
        LaneConfig {
            roi_top_ratio: 0.5,
            roi_left_ratio: 0.35,
            roi_right_ratio: 0.65,
            min_abs_slope: 0.3,
            max_abs_slope: 2.0,
            history_len: 3,
            fallback,
        }
    }

    fn line(x_bottom: f32, x_top: f32) -> LaneLine {
        LaneLine {
            x_bottom,
            y_bottom: 480.0,
            x_top,
            y_top: 240.0,
        }
    }

    #[test]
    fn test_history_averages_last_three_of_four() {
        let mut history = LaneLineHistory::new(3);
        history.push(line(100.0, 200.0)); // evicted
        history.push(line(10.0, 20.0));
        history.push(line(20.0, 40.0));
        history.push(line(30.0, 60.0));

        assert_eq!(history.len(), 3);
        let avg = history.average().unwrap();
        assert!((avg.x_bottom - 20.0).abs() < 1e-4);
        assert!((avg.x_top - 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_history_has_no_average() {
        let history = LaneLineHistory::new(3);
        assert!(history.average().is_none());
    }

    #[test]
    fn test_slope_partition_discards_outliers() {
        let mut estimator = LaneGeometryEstimator::new(lane_config(LaneFallback::LastRawFit));

        let segments = vec![
            [0.0, 480.0, 200.0, 240.0],   // left: slope -1.2
            [640.0, 480.0, 440.0, 240.0], // right: slope +1.2
            [0.0, 100.0, 500.0, 110.0],   // near-horizontal, discarded
            [100.0, 0.0, 110.0, 400.0],   // near-vertical (slope 40), discarded
        ];
        let geometry = estimator.update_from_segments(&segments, 640.0, 480.0);
        assert!(geometry.left.is_some());
        assert!(geometry.right.is_some());
    }

    #[test]
    fn test_fit_recovers_exact_line() {
        // Points on x = -0.5*y + 400 (left boundary style)
        let segments = vec![[160.0, 480.0, 280.0, 240.0]];
        let fitted = fit_line_through_segments(&segments, 480.0, 240.0).unwrap();
        assert!((fitted.x_bottom - 160.0).abs() < 1e-3);
        assert!((fitted.x_top - 280.0).abs() < 1e-3);
    }

    #[test]
    fn test_update_is_deterministic() {
        let segments = vec![
            [100.0, 480.0, 260.0, 240.0],
            [540.0, 480.0, 380.0, 240.0],
        ];

        let mut a = LaneGeometryEstimator::new(lane_config(LaneFallback::LastRawFit));
        let mut b = LaneGeometryEstimator::new(lane_config(LaneFallback::LastRawFit));
        for _ in 0..3 {
            a.update_from_segments(&segments, 640.0, 480.0);
            b.update_from_segments(&segments, 640.0, 480.0);
        }
        let ga = a.update_from_segments(&segments, 640.0, 480.0);
        let gb = b.update_from_segments(&segments, 640.0, 480.0);

        assert_eq!(ga.left.unwrap(), gb.left.unwrap());
        assert_eq!(ga.right.unwrap(), gb.right.unwrap());
        assert_eq!(ga.lane_center, gb.lane_center);
    }

    #[test]
    fn test_center_and_width_from_both_sides() {
        let mut estimator = LaneGeometryEstimator::new(lane_config(LaneFallback::LastRawFit));
        let segments = vec![
            [100.0, 480.0, 260.0, 240.0],
            [500.0, 480.0, 340.0, 240.0],
        ];
        let geometry = estimator.update_from_segments(&segments, 640.0, 480.0);
        assert!((geometry.lane_center - 300.0).abs() < 1.0);
        assert!((geometry.lane_width - 400.0).abs() < 1.0);
    }

    #[test]
    fn test_defaults_when_one_side_missing() {
        let mut estimator = LaneGeometryEstimator::new(lane_config(LaneFallback::LastRawFit));
        let segments = vec![[100.0, 480.0, 260.0, 240.0]]; // left only
        let geometry = estimator.update_from_segments(&segments, 640.0, 480.0);
        assert!(geometry.left.is_some());
        assert!(geometry.right.is_none());
        assert_eq!(geometry.lane_center, 320.0);
        assert_eq!(geometry.lane_width, 320.0);
    }

    #[test]
    fn test_last_raw_fit_fallback_repushes_previous_fit() {
        let mut estimator = LaneGeometryEstimator::new(lane_config(LaneFallback::LastRawFit));

        let first = vec![[100.0, 480.0, 260.0, 240.0]];
        let geometry = estimator.update_from_segments(&first, 640.0, 480.0);
        let fitted = geometry.left.unwrap();

        // Empty frame: the previous raw fit is pushed again, so the
        // history grows and the average stays at the raw fit.
        let geometry = estimator.update_from_segments(&[], 640.0, 480.0);
        assert_eq!(estimator.left.history.len(), 2);
        assert_eq!(geometry.left.unwrap(), fitted);
    }

    #[test]
    fn test_history_average_fallback_leaves_history_alone() {
        let mut estimator = LaneGeometryEstimator::new(lane_config(LaneFallback::HistoryAverage));

        let first = vec![[100.0, 480.0, 260.0, 240.0]];
        estimator.update_from_segments(&first, 640.0, 480.0);
        assert_eq!(estimator.left.history.len(), 1);

        estimator.update_from_segments(&[], 640.0, 480.0);
        assert_eq!(estimator.left.history.len(), 1);
    }
}
