// src/risk.rs
//
// Combines smoothed motion, lane-center proximity and a lane-invasion
// flag into a weighted score and a 3-level label. The legacy score is
// not clamped below zero (proximity goes negative for objects far
// outside the lane); `clamp_score` bounds the combined score to [0,1].

use crate::association::TrackedObject;
use crate::lane_geometry::LaneGeometry;
use crate::types::{RiskAssessment, RiskConfig, RiskLevel};

pub struct RiskScorer {
    cfg: RiskConfig,
}

impl RiskScorer {
    pub fn new(cfg: RiskConfig) -> Self {
        Self { cfg }
    }

    /// Score one tracked object against the current lane geometry. An
    /// identity first seen this frame has no history to compare
    /// against and is always (SAFE, 0).
    pub fn score(
        &self,
        track: &mut TrackedObject,
        geometry: &LaneGeometry,
        frame_id: u64,
    ) -> RiskAssessment {
        if track.first_seen_frame == frame_id {
            let assessment = RiskAssessment {
                level: RiskLevel::Safe,
                score: 0.0,
            };
            track.last_risk = Some(assessment);
            return assessment;
        }

        let motion = track.smoothed_motion.unwrap_or(0.0);
        let offset = (track.centroid.0 - geometry.lane_center).abs();

        let acc_factor = (motion / self.cfg.acc_norm_kmh).min(1.0);
        let proximity_factor =
            ((geometry.lane_width - offset) / self.cfg.proximity_norm_px).min(1.0);
        let lane_invasion = offset < self.cfg.invasion_ratio * geometry.lane_width;

        let mut score = self.cfg.acc_weight * acc_factor
            + self.cfg.proximity_weight * proximity_factor
            + if lane_invasion { self.cfg.invasion_weight } else { 0.0 };
        if self.cfg.clamp_score {
            score = score.clamp(0.0, 1.0);
        }

        let level = if score > self.cfg.danger_threshold {
            RiskLevel::Danger
        } else if score > self.cfg.warning_threshold {
            RiskLevel::Warning
        } else {
            RiskLevel::Safe
        };

        let assessment = RiskAssessment { level, score };
        track.last_risk = Some(assessment);
        assessment
    }
}
