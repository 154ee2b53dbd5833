// src/main.rs

mod accident_buffer;
mod association;
mod config;
mod lane_geometry;
mod motion;
mod pipeline;
mod risk;
mod types;
mod vehicle_detection;
mod video_source;

use accident_buffer::{AccidentRingBuffer, AccidentTrigger};
use anyhow::Result;
use pipeline::{FrameOrchestrator, ProcessedFrame};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};
use types::{Config, RiskLevel};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(config.logging.level.clone())
        .init();

    info!("🚗 roadguard risk pipeline starting");
    info!("✓ Configuration loaded from {}", config_path);
    info!(
        "Risk thresholds: danger={:.2}, warning={:.2}, clamp={}",
        config.risk.danger_threshold, config.risk.warning_threshold, config.risk.clamp_score
    );

    let mut reader = video_source::open_source(&config.video)?;
    let fps = reader.fps;

    let mut orchestrator = FrameOrchestrator::new(&config, fps)?;
    info!("✓ Frame orchestrator ready");

    let mut writer = video_source::create_writer(&config.video, fps)?;

    let mut ring = AccidentRingBuffer::new(config.accident.buffer_frames);
    let mut trigger = AccidentTrigger::new(
        config.accident.danger_frames_to_trigger,
        config.accident.cooldown_frames,
    );

    std::fs::create_dir_all(&config.video.output_dir)?;
    let events_path = Path::new(&config.video.output_dir).join("risk_events.jsonl");
    let mut events_file = std::fs::File::create(&events_path)?;
    info!("💾 Risk events will be written to: {}", events_path.display());

    match run_loop(
        &config,
        &mut reader,
        &mut orchestrator,
        writer.as_mut(),
        &mut ring,
        &mut trigger,
        &mut events_file,
    )
    .await
    {
        Ok(stats) => {
            info!("\n📊 Final Report:");
            info!("  Total frames: {}", stats.total_frames);
            info!("  Deadline misses: {}", stats.deadline_misses);
            info!("  Object observations: {}", stats.observations);
            info!("    SAFE: {}", stats.safe_count);
            info!("    WARNING: {}", stats.warning_count);
            info!("    DANGER: {}", stats.danger_count);
            info!("  Unique identities: {}", orchestrator.unique_identities());
            if stats.accident_dumps > 0 {
                warn!("  🚨 Accident dumps: {}", stats.accident_dumps);
            } else {
                info!("  Accident dumps: 0");
            }
            info!("  Processing speed: {:.1} FPS", stats.avg_fps);
        }
        Err(e) => error!("Processing failed: {}", e),
    }

    Ok(())
}

struct ProcessingStats {
    total_frames: u64,
    deadline_misses: u64,
    observations: u64,
    safe_count: u64,
    warning_count: u64,
    danger_count: u64,
    accident_dumps: u64,
    avg_fps: f64,
}

async fn run_loop(
    config: &Config,
    reader: &mut video_source::VideoReader,
    orchestrator: &mut FrameOrchestrator,
    mut writer: Option<&mut opencv::videoio::VideoWriter>,
    ring: &mut AccidentRingBuffer,
    trigger: &mut AccidentTrigger,
    events_file: &mut std::fs::File,
) -> Result<ProcessingStats> {
    let start_time = Instant::now();
    let mut frame_count: u64 = 0;
    let mut deadline_misses: u64 = 0;
    let mut observations: u64 = 0;
    let mut safe_count: u64 = 0;
    let mut warning_count: u64 = 0;
    let mut danger_count: u64 = 0;
    let mut accident_dumps: u64 = 0;

    let mut fps_display = 0.0f64;
    let mut fps_mark = Instant::now();
    let mut last_levels: HashMap<u32, RiskLevel> = HashMap::new();

    while let Some(frame) = reader.read_frame()? {
        frame_count += 1;

        let ProcessedFrame { frame, analysis } =
            orchestrator.process(frame, frame_count).await?;

        if config.accident.enabled {
            ring.push(frame.clone());
        }

        if frame_count % 30 == 0 {
            fps_display = 30.0 / fps_mark.elapsed().as_secs_f64();
            fps_mark = Instant::now();
        }

        let analysis = match analysis {
            Some(analysis) => analysis,
            None => {
                deadline_misses += 1;
                continue;
            }
        };

        let mut current_levels: HashMap<u32, RiskLevel> = HashMap::new();
        let mut danger_present = false;

        for object in &analysis.objects {
            observations += 1;
            match object.risk.level {
                RiskLevel::Safe => safe_count += 1,
                RiskLevel::Warning => warning_count += 1,
                RiskLevel::Danger => danger_count += 1,
            }
            if object.risk.level == RiskLevel::Danger {
                danger_present = true;
                // log only the transition into DANGER, not every frame
                if last_levels.get(&object.track_id) != Some(&RiskLevel::Danger) {
                    warn!(
                        "🚨 DANGER: {} #{} score={:.2} motion={:.1} km/h (frame {})",
                        object.class_name,
                        object.track_id,
                        object.risk.score,
                        object.motion_kmh,
                        frame_count
                    );
                    let event = serde_json::json!({
                        "type": "risk_danger",
                        "frame_id": frame_count,
                        "timestamp_ms": frame.timestamp_ms,
                        "track_id": object.track_id,
                        "class": object.class_name,
                        "score": object.risk.score,
                        "motion_kmh": object.motion_kmh,
                    });
                    writeln!(events_file, "{}", serde_json::to_string(&event)?)?;
                    events_file.flush()?;
                }
            }
            current_levels.insert(object.track_id, object.risk.level);
        }
        last_levels = current_levels;

        if config.accident.enabled && trigger.update(danger_present) {
            match ring.save_to(&config.accident.recordings_dir, reader.fps) {
                Ok(path) => {
                    accident_dumps += 1;
                    warn!("🚨 Accident buffer dumped to {}", path.display());
                }
                Err(e) => error!("Failed to dump accident buffer: {}", e),
            }
        }

        let annotated = video_source::draw_overlay(&frame, &analysis, fps_display)?;
        if let Some(w) = writer.as_deref_mut() {
            use opencv::videoio::VideoWriterTrait;
            w.write(&annotated)?;
        }
        if config.video.display {
            opencv::highgui::imshow("roadguard", &annotated)?;
            if opencv::highgui::wait_key(1)? == i32::from(b'q') {
                info!("Quit requested");
                break;
            }
        }

        if frame_count % 50 == 0 {
            info!(
                "Progress: {:.1}% ({}/{}) | objects: {} | danger so far: {}",
                reader.progress(),
                reader.current_frame,
                reader.total_frames,
                analysis.objects.len(),
                danger_count
            );
        }
    }

    let duration = start_time.elapsed();
    Ok(ProcessingStats {
        total_frames: frame_count,
        deadline_misses,
        observations,
        safe_count,
        warning_count,
        danger_count,
        accident_dumps,
        avg_fps: frame_count as f64 / duration.as_secs_f64().max(1e-6),
    })
}
