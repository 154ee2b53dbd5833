use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub video: VideoConfig,
    pub lane: LaneConfig,
    pub tracking: TrackingConfig,
    pub motion: MotionConfig,
    pub risk: RiskConfig,
    pub orchestrator: OrchestratorConfig,
    pub accident: AccidentConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: String,
    pub confidence_floor: f32,
    pub nms_iou_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub source: String,
    pub working_width: i32,
    pub working_height: i32,
    pub fallback_fps: f64,
    pub output_dir: String,
    pub save_annotated: bool,
    pub display: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    pub roi_top_ratio: f32,
    pub roi_left_ratio: f32,
    pub roi_right_ratio: f32,
    pub min_abs_slope: f32,
    pub max_abs_slope: f32,
    pub history_len: usize,
    pub fallback: LaneFallback,
}

/// What a side contributes when it has no Hough candidates this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneFallback {
    /// Re-push the previous raw fit into the history (original behavior).
    LastRawFit,
    /// Push nothing; the existing history average stands.
    HistoryAverage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub gate_px: f32,
    pub matching: MatchingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingMode {
    /// Processing-order assignment: first detection to reach a track
    /// under the gate claims it, later ones mint fresh ids.
    Legacy,
    /// Conflict-free greedy-by-distance assignment over all pairs.
    GreedyDistance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    pub scale_factor: f32,
    pub smoothing_alpha: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub acc_weight: f32,
    pub proximity_weight: f32,
    pub invasion_weight: f32,
    pub acc_norm_kmh: f32,
    pub proximity_norm_px: f32,
    pub invasion_ratio: f32,
    pub danger_threshold: f32,
    pub warning_threshold: f32,
    pub clamp_score: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub frame_deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccidentConfig {
    pub enabled: bool,
    pub buffer_frames: usize,
    pub danger_frames_to_trigger: u32,
    pub cooldown_frames: u32,
    pub recordings_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// One BGR frame at working resolution. Owned by the orchestrator for
/// exactly one loop iteration; the accident buffer keeps clones.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskLevel {
    Safe,
    Warning,
    Danger,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Warning => "WARNING",
            Self::Danger => "DANGER",
        }
    }

    /// BGR box color for the overlay.
    pub fn color(&self) -> (f64, f64, f64) {
        match self {
            Self::Safe => (0.0, 255.0, 0.0),
            Self::Warning => (0.0, 255.0, 255.0),
            Self::Danger => (0.0, 0.0, 255.0),
        }
    }
}

/// Derived fresh each frame; not persisted beyond the track's last_risk.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub score: f32,
}
