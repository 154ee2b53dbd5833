// src/video_source.rs

use crate::pipeline::FrameAnalysis;
use crate::types::{Frame, VideoConfig};
use anyhow::Result;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTraitConst, VideoWriter},
};
use std::path::PathBuf;
use tracing::info;

pub struct VideoReader {
    pub cap: VideoCapture,
    pub fps: f64,
    pub total_frames: i32,
    pub current_frame: i32,
    pub width: i32,
    pub height: i32,
}

/// An integer source string opens a webcam at that index, anything
/// else is treated as a file path — the selection scheme the demo
/// scripts used.
pub fn open_source(cfg: &VideoConfig) -> Result<VideoReader> {
    let cap = match cfg.source.parse::<i32>() {
        Ok(index) => {
            info!("Opening webcam {}", index);
            let mut cap = VideoCapture::new(index, videoio::CAP_ANY)?;
            videoio::VideoCaptureTrait::set(
                &mut cap,
                videoio::CAP_PROP_FRAME_WIDTH,
                cfg.working_width as f64,
            )?;
            videoio::VideoCaptureTrait::set(
                &mut cap,
                videoio::CAP_PROP_FRAME_HEIGHT,
                cfg.working_height as f64,
            )?;
            cap
        }
        Err(_) => {
            info!("Opening video file: {}", cfg.source);
            VideoCapture::from_file(&cfg.source, videoio::CAP_ANY)?
        }
    };

    if !cap.is_opened()? {
        anyhow::bail!("could not open video source {}", cfg.source);
    }

    let mut fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
    if fps <= 0.0 {
        // webcams commonly report 0
        fps = cfg.fallback_fps;
    }
    let total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)? as i32;
    let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
    let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

    info!(
        "Source properties: {}x{} @ {:.1} FPS, {} frames",
        width, height, fps, total_frames
    );

    Ok(VideoReader {
        cap,
        fps,
        total_frames,
        current_frame: 0,
        width,
        height,
    })
}

impl VideoReader {
    /// Next BGR frame, or None on source exhaustion (the loop's only
    /// terminal condition).
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        use opencv::videoio::VideoCaptureTrait;

        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        self.current_frame += 1;
        let timestamp_ms = (self.current_frame as f64 / self.fps) * 1000.0;
        let size = mat.size()?;

        Ok(Some(Frame {
            data: mat.data_bytes()?.to_vec(),
            width: size.width as usize,
            height: size.height as usize,
            timestamp_ms,
        }))
    }

    pub fn progress(&self) -> f32 {
        if self.total_frames <= 0 {
            return 0.0;
        }
        (self.current_frame as f32 / self.total_frames as f32) * 100.0
    }
}

pub fn create_writer(cfg: &VideoConfig, fps: f64) -> Result<Option<VideoWriter>> {
    if !cfg.save_annotated {
        return Ok(None);
    }

    std::fs::create_dir_all(&cfg.output_dir)?;
    let output_path = PathBuf::from(&cfg.output_dir).join("annotated.mp4");
    info!("Output video: {}", output_path.display());

    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let writer = VideoWriter::new(
        output_path.to_str().unwrap(),
        fourcc,
        fps,
        core::Size::new(cfg.working_width, cfg.working_height),
        true,
    )?;
    Ok(Some(writer))
}

/// Reconstruct an owned BGR Mat from a Frame's raw bytes.
pub fn frame_to_mat(frame: &Frame) -> Result<Mat> {
    let mat = Mat::from_slice(&frame.data)?;
    let mat = mat.reshape(3, frame.height as i32)?;
    Ok(mat.try_clone()?)
}

/// Compose the frame overlay: translucent lane polygon, risk-colored
/// bounding boxes with id/speed/risk labels, and an FPS readout.
pub fn draw_overlay(frame: &Frame, analysis: &FrameAnalysis, fps_display: f64) -> Result<Mat> {
    let mut output = frame_to_mat(frame)?;

    if let (Some(left), Some(right)) = (analysis.geometry.left, analysis.geometry.right) {
        let mut overlay = output.try_clone()?;
        let mut vertices: core::Vector<core::Point> = core::Vector::new();
        vertices.push(core::Point::new(left.x_bottom as i32, left.y_bottom as i32));
        vertices.push(core::Point::new(left.x_top as i32, left.y_top as i32));
        vertices.push(core::Point::new(right.x_top as i32, right.y_top as i32));
        vertices.push(core::Point::new(right.x_bottom as i32, right.y_bottom as i32));
        let mut polygons: core::Vector<core::Vector<core::Point>> = core::Vector::new();
        polygons.push(vertices);
        imgproc::fill_poly(
            &mut overlay,
            &polygons,
            core::Scalar::new(0.0, 255.0, 0.0, 0.0),
            imgproc::LINE_8,
            0,
            core::Point::new(0, 0),
        )?;
        let src = output.try_clone()?;
        core::add_weighted(&overlay, 0.35, &src, 0.65, 0.0, &mut output, -1)?;
    }

    for object in &analysis.objects {
        let (b, g, r) = object.risk.level.color();
        let color = core::Scalar::new(b, g, r, 0.0);
        let [x1, y1, x2, y2] = object.bbox;
        let rect = core::Rect::new(
            x1 as i32,
            y1 as i32,
            (x2 - x1).max(1.0) as i32,
            (y2 - y1).max(1.0) as i32,
        );
        imgproc::rectangle(&mut output, rect, color, 2, imgproc::LINE_8, 0)?;

        let labels = [
            format!("#{} {}", object.track_id, object.class_name),
            format!("{:.1} km/h", object.motion_kmh),
            format!(
                "{} ({:.2})",
                object.risk.level.as_str(),
                object.risk.score
            ),
        ];
        for (i, text) in labels.iter().enumerate() {
            let y_offset = y1 as i32 - 10 - (i as i32 * 15);
            imgproc::put_text(
                &mut output,
                text,
                core::Point::new(x1 as i32, y_offset.max(12)),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.4,
                color,
                1,
                imgproc::LINE_8,
                false,
            )?;
        }
    }

    imgproc::put_text(
        &mut output,
        &format!("FPS: {:.1}", fps_display),
        core::Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        1.0,
        core::Scalar::new(0.0, 255.0, 0.0, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mat_round_trip() {
        let frame = Frame {
            data: vec![7u8; 30 * 20 * 3],
            width: 20,
            height: 30,
            timestamp_ms: 0.0,
        };
        let mat = frame_to_mat(&frame).unwrap();
        let size = mat.size().unwrap();
        assert_eq!((size.width, size.height), (20, 30));
        assert_eq!(mat.channels(), 3);
        assert_eq!(mat.data_bytes().unwrap(), frame.data.as_slice());
    }
}
