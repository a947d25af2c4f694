//! Frame-quantized channel buffer for a whole show.
//!
//! The canvas holds one [`DmxFrame`] per frame slot at a fixed frame rate.
//! Renderers paint into it, the playback loop samples it. Every operation
//! takes the grid lock once, so a paint call is atomic with respect to the
//! frames it touches, and no operation ever fails on an out-of-range time or
//! channel: times are clamped into the show, channels outside the universe
//! are ignored and values are clamped to `0..=255`.

use parking_lot::RwLock;
use std::fmt::Write as _;
use std::ops::RangeInclusive;

use crate::dmx_types::{DMX_CHANNELS, DmxFrame, clamp_level};

/// Maximum number of rows [`Canvas::export_text`] produces.
pub const EXPORT_TEXT_MAX_ROWS: usize = 2000;

struct Grid {
    duration: f64,
    frames: Vec<DmxFrame>,
}

impl Grid {
    fn new(duration: f64, fps: f64) -> Self {
        let duration = if duration.is_finite() && duration > 0.0 {
            duration
        } else {
            0.0
        };
        let count = ((duration * fps).ceil() as usize).max(1);
        Self {
            duration,
            frames: vec![[0u8; DMX_CHANNELS]; count],
        }
    }
}

pub struct Canvas {
    fps: f64,
    grid: RwLock<Grid>,
}

impl Canvas {
    /// Creates a blacked-out canvas covering `duration` seconds.
    /// A non-positive `fps` falls back to 44 frames per second.
    pub fn new(duration: f64, fps: f64) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 44.0 };
        Self {
            fps,
            grid: RwLock::new(Grid::new(duration, fps)),
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn duration(&self) -> f64 {
        self.grid.read().duration
    }

    pub fn num_frames(&self) -> usize {
        self.grid.read().frames.len()
    }

    /// Replaces the grid with a blacked-out one sized for a new track.
    pub fn reload(&self, duration: f64) {
        let grid = Grid::new(duration, self.fps);
        tracing::debug!(duration = grid.duration, frames = grid.frames.len(), "canvas reloaded");
        *self.grid.write() = grid;
    }

    /// Zeroes every frame in place.
    pub fn clear(&self) {
        let mut grid = self.grid.write();
        grid.frames.iter_mut().for_each(|f| f.fill(0));
    }

    /// Frame slot nearest `timestamp`, clamped into the canvas.
    pub fn frame_index(&self, timestamp: f64) -> usize {
        let len = self.grid.read().frames.len();
        index_for(timestamp, self.fps, len)
    }

    /// Time at which frame slot `index` starts.
    pub fn frame_time(&self, index: usize) -> f64 {
        index as f64 / self.fps
    }

    /// Writes `values` into the frame nearest `timestamp`.
    pub fn paint_frame<I>(&self, timestamp: f64, values: I)
    where
        I: IntoIterator<Item = (usize, f32)>,
    {
        let mut grid = self.grid.write();
        let idx = index_for(timestamp, self.fps, grid.frames.len());
        apply(&mut grid.frames[idx], values);
    }

    /// Writes `value_fn(progress)` into `channel` for every frame whose time
    /// lies in `[start_time, start_time + duration]`, with progress running
    /// from 0 at the start to 1 at the end. A zero duration writes
    /// `value_fn(1.0)` into the single frame nearest `start_time`.
    pub fn paint_channel<F>(&self, channel: usize, start_time: f64, duration: f64, value_fn: F)
    where
        F: Fn(f32) -> f32,
    {
        if channel >= DMX_CHANNELS || !(duration >= 0.0) || !start_time.is_finite() {
            return;
        }
        let mut grid = self.grid.write();
        if duration == 0.0 {
            let idx = index_for(start_time, self.fps, grid.frames.len());
            grid.frames[idx][channel] = clamp_level(value_fn(1.0));
            return;
        }
        let Some(frames) = span(start_time, start_time + duration, self.fps, grid.frames.len())
        else {
            return;
        };
        for idx in frames {
            let t = idx as f64 / self.fps;
            let progress = ((t - start_time) / duration).clamp(0.0, 1.0) as f32;
            grid.frames[idx][channel] = clamp_level(value_fn(progress));
        }
    }

    /// Calls `f` once per frame whose time lies in `[start, end]` and applies
    /// the sparse channel map it returns.
    pub fn paint_range<F, I>(&self, start: f64, end: f64, mut f: F)
    where
        F: FnMut(f64) -> I,
        I: IntoIterator<Item = (usize, f32)>,
    {
        let mut grid = self.grid.write();
        let Some(frames) = span(start, end, self.fps, grid.frames.len()) else {
            return;
        };
        for idx in frames {
            let values = f(idx as f64 / self.fps);
            apply(&mut grid.frames[idx], values);
        }
    }

    /// Snapshot of the frame nearest `timestamp`. Never fails: times outside
    /// the canvas read the first or last frame.
    pub fn get_frame(&self, timestamp: f64) -> DmxFrame {
        let grid = self.grid.read();
        grid.frames[index_for(timestamp, self.fps, grid.frames.len())]
    }

    /// Every frame with its start time.
    pub fn export(&self) -> Vec<(f64, DmxFrame)> {
        let grid = self.grid.read();
        grid.frames
            .iter()
            .enumerate()
            .map(|(idx, frame)| (idx as f64 / self.fps, *frame))
            .collect()
    }

    /// Plain-text table of `channels` (0-based slots) for frames in
    /// `[start, end]`, capped at [`EXPORT_TEXT_MAX_ROWS`] rows. Column headers
    /// are DMX addresses.
    pub fn export_text(&self, start: f64, end: f64, channels: RangeInclusive<usize>) -> String {
        let first = *channels.start();
        let last = (*channels.end()).min(DMX_CHANNELS - 1);
        let mut out = String::from("    time |");
        for ch in first..=last {
            let _ = write!(out, " {:>3}", ch + 1);
        }
        out.push('\n');

        let grid = self.grid.read();
        let Some(frames) = span(start, end, self.fps, grid.frames.len()) else {
            return out;
        };
        for idx in frames.take(EXPORT_TEXT_MAX_ROWS) {
            let _ = write!(out, "{:>8.3} |", idx as f64 / self.fps);
            for ch in first..=last {
                let _ = write!(out, " {:>3}", grid.frames[idx][ch]);
            }
            out.push('\n');
        }
        out
    }
}

fn index_for(timestamp: f64, fps: f64, len: usize) -> usize {
    let raw = (timestamp * fps).round();
    if raw.is_nan() || raw <= 0.0 {
        0
    } else {
        (raw as usize).min(len - 1)
    }
}

/// Frame slots whose start time lies in `[start, end]`, clamped to the grid.
fn span(start: f64, end: f64, fps: f64, len: usize) -> Option<RangeInclusive<usize>> {
    if !(start <= end) {
        return None;
    }
    // Tolerate float noise so a time that is a whole frame stays inclusive.
    const EPS: f64 = 1e-9;
    let first = (start * fps - EPS).ceil().max(0.0);
    let last = (end * fps + EPS).floor();
    if last < 0.0 || first > last {
        return None;
    }
    let first = first as usize;
    let last = (last as usize).min(len - 1);
    (first <= last).then_some(first..=last)
}

fn apply<I>(frame: &mut DmxFrame, values: I)
where
    I: IntoIterator<Item = (usize, f32)>,
{
    for (channel, value) in values {
        if let Some(slot) = frame.get_mut(channel) {
            *slot = clamp_level(value);
        }
    }
}
