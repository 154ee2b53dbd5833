// src/accident_buffer.rs
//
// Rolling buffer of the most recent frames, dumped to disk when a
// sustained DANGER condition fires. The trigger is debounced: a single
// noisy DANGER frame does not cut a recording, and a cooldown keeps
// one incident from producing a burst of near-identical clips.

use crate::types::Frame;
use crate::video_source::frame_to_mat;
use anyhow::Result;
use opencv::{
    core,
    videoio::{VideoWriter, VideoWriterTrait},
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

pub struct AccidentRingBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl AccidentRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(frame);
        if self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Write the buffered frames to a timestamped mp4 under `dir`.
    /// The buffer is left intact; the caller decides when to keep
    /// feeding it.
    pub fn save_to(&self, dir: &str, fps: f64) -> Result<PathBuf> {
        let first = match self.frames.front() {
            Some(frame) => frame,
            None => anyhow::bail!("accident buffer is empty"),
        };

        std::fs::create_dir_all(dir)?;
        let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let output_path = Path::new(dir).join(format!("accident_{}.mp4", stamp));

        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let mut writer = VideoWriter::new(
            output_path.to_str().unwrap(),
            fourcc,
            fps,
            core::Size::new(first.width as i32, first.height as i32),
            true,
        )?;

        for frame in &self.frames {
            let mat = frame_to_mat(frame)?;
            writer.write(&mat)?;
        }
        writer.release()?;

        info!(
            "saved {} buffered frame(s) to {}",
            self.frames.len(),
            output_path.display()
        );
        Ok(output_path)
    }
}

/// Debounced DANGER trigger: fires after `required` consecutive frames
/// containing a DANGER object, then holds off for `cooldown` frames.
pub struct AccidentTrigger {
    required: u32,
    cooldown: u32,
    consecutive: u32,
    cooldown_left: u32,
}

impl AccidentTrigger {
    pub fn new(required: u32, cooldown: u32) -> Self {
        Self {
            required,
            cooldown,
            consecutive: 0,
            cooldown_left: 0,
        }
    }

    pub fn update(&mut self, danger_present: bool) -> bool {
        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.consecutive = 0;
            return false;
        }

        if danger_present {
            self.consecutive += 1;
            if self.consecutive >= self.required {
                self.consecutive = 0;
                self.cooldown_left = self.cooldown;
                return true;
            }
        } else {
            self.consecutive = 0;
        }
        false
    }
}
