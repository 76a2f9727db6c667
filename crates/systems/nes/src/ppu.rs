//! Picture unit stand-in
//!
//! Only frame timing is modelled: the unit counts its own steps and reports a
//! frame as ready once a full frame's worth of dots has elapsed. The pixel
//! buffer is kept at the visible resolution but nothing is drawn into it.

use pane_core::logging::{log, LogCategory, LogLevel};
use pane_core::types::Frame;
use serde::{Deserialize, Serialize};

pub const VISIBLE_WIDTH: u32 = 256;
pub const VISIBLE_HEIGHT: u32 = 240;
pub const DOTS_PER_SCANLINE: u64 = 341;
pub const SCANLINES_PER_FRAME: u64 = 262;
pub const DOTS_PER_FRAME: u64 = DOTS_PER_SCANLINE * SCANLINES_PER_FRAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PpuSnapshot {
    pub dots: u64,
    pub frames: u64,
}

#[derive(Debug, Clone)]
pub struct Ppu {
    /// Dots since the last completed frame
    dots: u64,
    frame_dots: u64,
    frames: u64,
    frame: Frame,
}

impl Ppu {
    pub fn new(frame_dots: u64) -> Self {
        Self {
            dots: 0,
            frame_dots,
            frames: 0,
            frame: Frame::new(VISIBLE_WIDTH, VISIBLE_HEIGHT),
        }
    }

    pub fn reset(&mut self) {
        self.dots = 0;
        self.frames = 0;
    }

    /// One dot.
    pub fn step(&mut self) {
        self.dots += 1;
    }

    pub fn should_render(&self) -> bool {
        self.dots >= self.frame_dots
    }

    /// Acknowledge a presented frame. Dots past the frame boundary carry over
    /// so the long-run frame rate stays exact.
    pub fn rendered(&mut self) {
        self.dots = self.dots.saturating_sub(self.frame_dots);
        self.frames += 1;
        log(LogCategory::PPU, LogLevel::Trace, || {
            format!("PPU: frame {} complete", self.frames)
        });
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn dots(&self) -> u64 {
        self.dots
    }

    pub fn snapshot(&self) -> PpuSnapshot {
        PpuSnapshot {
            dots: self.dots,
            frames: self.frames,
        }
    }

    pub fn restore(&mut self, s: &PpuSnapshot) {
        self.dots = s.dots;
        self.frames = s.frames;
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new(DOTS_PER_FRAME)
    }
}
